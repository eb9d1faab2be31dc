//! JSON-line IPC over the daemon's Unix socket.
//!
//! Every request is one line: `{id, method, params}`. Every reply is one
//! line: `{id, success, data?, error?}`. Failures never cross the boundary
//! as anything but a serialized error string.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, warn};

use devport_core::wire::{
    self, IdParams, ProjectIdParams, Request, Response, TailLogsParams,
    UpdateProjectParams, UpdateQuickAccessSiteParams,
};
use devport_core::{LogTail, NewProject, NewQuickAccessSite};

use crate::config_store::ConfigStore;
use crate::supervisor::{Supervisor, stop_grace};

const DEFAULT_TAIL_LIMIT: usize = 200;

#[derive(Clone)]
pub struct Handler {
    pub supervisor: Supervisor,
    pub config: ConfigStore,
    pub shutdown: Arc<Notify>,
}

pub async fn serve(listener: UnixListener, handler: Handler) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, handler).await {
                        debug!("connection ended: {err}");
                    }
                });
            }
            Err(err) => {
                warn!("accept error: {err}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handler: Handler) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let (response, shutdown_requested) = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                let shutdown = req.method == wire::METHOD_SHUTDOWN;
                (handler.dispatch(req).await, shutdown)
            }
            Err(err) => (Response::err(0, format!("invalid request: {err}")), false),
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;

        if shutdown_requested {
            // The reply is on the wire; let main tear the daemon down.
            handler.shutdown.notify_one();
            break;
        }
    }

    Ok(())
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))
}

impl Handler {
    async fn dispatch(&self, req: Request) -> Response {
        let id = req.id;
        match self.dispatch_inner(req).await {
            Ok(data) => Response::ok(id, data),
            Err(message) => Response::err(id, message),
        }
    }

    async fn dispatch_inner(&self, req: Request) -> Result<Value, String> {
        match req.method.as_str() {
            wire::METHOD_PING => Ok(json!({ "version": env!("CARGO_PKG_VERSION") })),
            wire::METHOD_SHUTDOWN => Ok(json!(true)),

            wire::METHOD_GET_CONFIG => {
                let config = self.config.get_config().await;
                serde_json::to_value(config).map_err(|e| e.to_string())
            }
            wire::METHOD_GET_PROJECTS => {
                let projects = self.config.list_projects().await;
                serde_json::to_value(projects).map_err(|e| e.to_string())
            }
            wire::METHOD_ADD_PROJECT => {
                let new: NewProject = parse_params(req.params)?;
                let project = self
                    .config
                    .add_project(new)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(project).map_err(|e| e.to_string())
            }
            wire::METHOD_UPDATE_PROJECT => {
                let params: UpdateProjectParams = parse_params(req.params)?;
                let updated = self
                    .config
                    .update_project(&params.id, params.updates)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("project not found: {}", params.id))?;
                serde_json::to_value(updated).map_err(|e| e.to_string())
            }
            wire::METHOD_DELETE_PROJECT => {
                let params: IdParams = parse_params(req.params)?;
                if self.supervisor.is_live(&params.id).await {
                    return Err(format!(
                        "server for project {} is still running; stop it first",
                        params.id
                    ));
                }
                let deleted = self
                    .config
                    .delete_project(&params.id)
                    .await
                    .map_err(|e| e.to_string())?;
                if !deleted {
                    return Err(format!("project not found: {}", params.id));
                }
                Ok(json!(true))
            }

            wire::METHOD_START_SERVER => {
                let params: ProjectIdParams = parse_params(req.params)?;
                let started = self
                    .supervisor
                    .start(&params.project_id)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(started).map_err(|e| e.to_string())
            }
            wire::METHOD_STOP_SERVER => {
                let params: ProjectIdParams = parse_params(req.params)?;
                self.supervisor
                    .stop(&params.project_id, stop_grace())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(true))
            }
            wire::METHOD_GET_RUNNING_SERVERS => {
                let servers = self.supervisor.list_running().await;
                serde_json::to_value(servers).map_err(|e| e.to_string())
            }
            wire::METHOD_GET_SERVER_LOGS => {
                let params: ProjectIdParams = parse_params(req.params)?;
                let logs = self
                    .supervisor
                    .get_logs(&params.project_id)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(logs).map_err(|e| e.to_string())
            }
            wire::METHOD_TAIL_SERVER_LOGS => {
                let params: TailLogsParams = parse_params(req.params)?;
                let limit = if params.limit == 0 {
                    DEFAULT_TAIL_LIMIT
                } else {
                    params.limit
                };
                let (lines, next_cursor) = self
                    .supervisor
                    .tail_logs(&params.project_id, params.cursor, limit)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(LogTail { lines, next_cursor }).map_err(|e| e.to_string())
            }
            wire::METHOD_CLEAR_SERVER => {
                let params: ProjectIdParams = parse_params(req.params)?;
                self.supervisor
                    .clear(&params.project_id)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(true))
            }

            wire::METHOD_ADD_QUICK_ACCESS_SITE => {
                let new: NewQuickAccessSite = parse_params(req.params)?;
                let site = self
                    .config
                    .add_quick_access_site(new)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(site).map_err(|e| e.to_string())
            }
            wire::METHOD_UPDATE_QUICK_ACCESS_SITE => {
                let params: UpdateQuickAccessSiteParams = parse_params(req.params)?;
                let updated = self
                    .config
                    .update_quick_access_site(&params.id, params.updates)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("quick access site not found: {}", params.id))?;
                serde_json::to_value(updated).map_err(|e| e.to_string())
            }
            wire::METHOD_DELETE_QUICK_ACCESS_SITE => {
                let params: IdParams = parse_params(req.params)?;
                let deleted = self
                    .config
                    .delete_quick_access_site(&params.id)
                    .await
                    .map_err(|e| e.to_string())?;
                if !deleted {
                    return Err(format!("quick access site not found: {}", params.id));
                }
                Ok(json!(true))
            }

            other => Err(format!("unknown method: {other}")),
        }
    }
}
