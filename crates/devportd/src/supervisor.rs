//! The server supervisor: one entry per started project, mutated only
//! under the map lock. Output pumps and exit waiters run as tasks and push
//! their transitions back into the map; IPC reads take snapshots.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use devport_core::{RunningServerInfo, ServerState, StartedServer};

use crate::config_store::ConfigStore;
use crate::log_buffer::{LogBuffer, LogSink};
use crate::port_alloc::{self, PortError};
use crate::process;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// How long a stopped server gets to exit on SIGTERM before SIGKILL.
pub fn stop_grace() -> Duration {
    Duration::from_millis(
        env_u64("DEVPORT_STOP_GRACE_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(5_000),
    )
}

/// Upper bound on waiting for all servers during daemon shutdown.
pub fn shutdown_timeout() -> Duration {
    Duration::from_millis(
        env_u64("DEVPORT_SHUTDOWN_TIMEOUT_MS")
            .map(|v| v.clamp(1_000, 120_000))
            .unwrap_or(10_000),
    )
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error(transparent)]
    PortUnavailable(#[from] PortError),
    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no running server for project {0}")]
    NotRunning(String),
    #[error("server for project {0} is still running; stop it first")]
    StillRunning(String),
}

struct ServerEntry {
    project_name: String,
    port: u16,
    state: ServerState,
    pid: Option<u32>,
    pgid: Option<i32>,
    exit_code: Option<i32>,
    message: Option<String>,
    started_at: DateTime<Utc>,
    logs: Arc<Mutex<LogBuffer>>,
}

#[derive(Clone)]
pub struct Supervisor {
    config: ConfigStore,
    inner: Arc<Mutex<HashMap<String, ServerEntry>>>,
}

impl Supervisor {
    pub fn new(config: ConfigStore) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a project's dev server. A second start while an instance is
    /// live is a no-op that reports the existing port. A retained terminal
    /// entry (a crash kept around for inspection) is superseded.
    pub async fn start(&self, project_id: &str) -> Result<StartedServer, SupervisorError> {
        {
            let mut map = self.inner.lock().await;
            if let Some(e) = map.get(project_id) {
                if e.state.is_live() {
                    return Ok(StartedServer {
                        port: e.port,
                        already_running: true,
                    });
                }
                map.remove(project_id);
            }
        }

        let project = self
            .config
            .get_project(project_id)
            .await
            .ok_or_else(|| SupervisorError::ProjectNotFound(project_id.to_string()))?;
        let port = port_alloc::allocate(project.port)?;

        let logs = Arc::new(Mutex::new(LogBuffer::default()));
        let sink = LogSink::new(logs.clone());

        {
            let mut map = self.inner.lock().await;
            if let Some(e) = map.get(project_id)
                && e.state.is_live()
            {
                // Lost a race against a concurrent start for the same project.
                return Ok(StartedServer {
                    port: e.port,
                    already_running: true,
                });
            }
            map.insert(
                project_id.to_string(),
                ServerEntry {
                    project_name: project.name.clone(),
                    port,
                    state: ServerState::Starting,
                    pid: None,
                    pgid: None,
                    exit_code: None,
                    message: Some("starting".to_string()),
                    started_at: Utc::now(),
                    logs: logs.clone(),
                },
            );
        }

        let child = match process::spawn(&project.command, Path::new(&project.path), port, &sink) {
            Ok(child) => child,
            Err(err) => {
                self.inner.lock().await.remove(project_id);
                return Err(SupervisorError::SpawnFailed {
                    command: project.command.clone(),
                    source: err,
                });
            }
        };
        let pid = child.pid;
        let pgid = child.pgid;

        // The process exists at the OS level now; that is as much readiness
        // as we can observe without knowing the server's protocol.
        let mut stop_pending = false;
        {
            let mut map = self.inner.lock().await;
            match map.get_mut(project_id) {
                Some(e) => {
                    e.pid = pid;
                    e.pgid = pgid;
                    if matches!(e.state, ServerState::Stopping) {
                        // A stop raced the spawn; honor it now that there is
                        // a process group to signal.
                        stop_pending = true;
                    } else {
                        e.state = ServerState::Running;
                        e.message = None;
                    }
                }
                None => stop_pending = true,
            }
        }
        if stop_pending && let Some(pgid) = pgid {
            process::signal_group(pgid, libc::SIGTERM);
        }

        info!(%project_id, port, pid = pid.unwrap_or_default(), "dev server started");

        let inner = self.inner.clone();
        let id = project_id.to_string();
        tokio::spawn(async move {
            let res = child.wait().await;

            let mut map = inner.lock().await;
            let stopping = match map.get(&id) {
                // A newer start replaced this entry; its own waiter owns it.
                Some(e) if e.pid != pid => return,
                Some(e) => matches!(e.state, ServerState::Stopping),
                None => return,
            };

            let exit_code = res.as_ref().ok().and_then(|status| status.code());
            let (state, detail) = match res {
                Ok(_) if stopping => (ServerState::Stopped, "stopped".to_string()),
                Ok(status) if status.success() => (ServerState::Stopped, "exited".to_string()),
                Ok(status) => {
                    let detail = match status.code() {
                        Some(code) => format!("exited with code {code}"),
                        None => "terminated by signal".to_string(),
                    };
                    (ServerState::Error, detail)
                }
                Err(err) => (ServerState::Error, format!("wait failed: {err}")),
            };
            info!(%id, state = %state, detail = %detail, "dev server exited");

            // Clean exits leave the map; failures are retained so logs stay
            // inspectable until the next start or an explicit clear.
            if matches!(state, ServerState::Stopped) {
                map.remove(&id);
            } else if let Some(e) = map.get_mut(&id) {
                e.state = state;
                e.exit_code = exit_code;
                e.message = Some(detail);
            }
        });

        Ok(StartedServer {
            port,
            already_running: false,
        })
    }

    /// Stop a live server: SIGTERM to its process group, SIGKILL once the
    /// grace period elapses, return when the exit is confirmed. Stopping an
    /// entry that is still `Starting` queues the intent; the spawn path
    /// delivers the signal as soon as a process group exists.
    pub async fn stop(&self, project_id: &str, grace: Duration) -> Result<(), SupervisorError> {
        let pgid = {
            let mut map = self.inner.lock().await;
            let e = map
                .get_mut(project_id)
                .ok_or_else(|| SupervisorError::NotRunning(project_id.to_string()))?;
            if !e.state.is_live() {
                return Err(SupervisorError::NotRunning(project_id.to_string()));
            }
            e.state = ServerState::Stopping;
            e.message = Some("stopping".to_string());
            e.pgid
        };

        if let Some(pgid) = pgid {
            process::signal_group(pgid, libc::SIGTERM);
        }

        let started = tokio::time::Instant::now();
        let kill_deadline = started + grace;
        // SIGKILL cannot be ignored; a short extra window covers reaping.
        let hard_deadline = kill_deadline + Duration::from_secs(2);
        let mut killed = false;

        loop {
            {
                let map = self.inner.lock().await;
                match map.get(project_id) {
                    None => return Ok(()),
                    Some(e) if !e.state.is_live() => return Ok(()),
                    Some(_) => {}
                }
            }

            let now = tokio::time::Instant::now();
            if !killed && now >= kill_deadline {
                let pgid = {
                    let mut map = self.inner.lock().await;
                    map.get_mut(project_id).and_then(|e| {
                        e.message = Some("killed after grace period".to_string());
                        e.pgid
                    })
                };
                if let Some(pgid) = pgid {
                    warn!(%project_id, "graceful stop timed out; sending SIGKILL");
                    process::signal_group(pgid, libc::SIGKILL);
                }
                killed = true;
            }

            if now >= hard_deadline {
                warn!(%project_id, "server did not reap after SIGKILL; abandoning the wait");
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Snapshot of every tracked server, ordered by start time so polling
    /// UIs see a stable list.
    pub async fn list_running(&self) -> Vec<RunningServerInfo> {
        let map = self.inner.lock().await;
        let mut out: Vec<RunningServerInfo> = map
            .iter()
            .map(|(id, e)| RunningServerInfo {
                project_id: id.clone(),
                project_name: e.project_name.clone(),
                port: e.port,
                state: e.state,
                pid: e.pid,
                exit_code: e.exit_code,
                message: e.message.clone(),
                started_at: e.started_at,
            })
            .collect();
        out.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.project_id.cmp(&b.project_id))
        });
        out
    }

    pub async fn is_live(&self, project_id: &str) -> bool {
        let map = self.inner.lock().await;
        map.get(project_id).is_some_and(|e| e.state.is_live())
    }

    /// Full log snapshot for a tracked server, retained crashes included.
    pub async fn get_logs(&self, project_id: &str) -> Result<Vec<String>, SupervisorError> {
        let logs = {
            let map = self.inner.lock().await;
            map.get(project_id)
                .ok_or_else(|| SupervisorError::NotRunning(project_id.to_string()))?
                .logs
                .clone()
        };

        let guard = logs.lock().await;
        Ok(guard.snapshot())
    }

    /// Incremental log read for pollers; see [`LogBuffer::tail_after`].
    pub async fn tail_logs(
        &self,
        project_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64), SupervisorError> {
        let logs = {
            let map = self.inner.lock().await;
            map.get(project_id)
                .ok_or_else(|| SupervisorError::NotRunning(project_id.to_string()))?
                .logs
                .clone()
        };

        let guard = logs.lock().await;
        Ok(guard.tail_after(cursor, limit))
    }

    /// Discard a retained terminal entry. Live entries must be stopped
    /// instead.
    pub async fn clear(&self, project_id: &str) -> Result<(), SupervisorError> {
        let mut map = self.inner.lock().await;
        match map.get(project_id) {
            None => Err(SupervisorError::NotRunning(project_id.to_string())),
            Some(e) if e.state.is_live() => {
                Err(SupervisorError::StillRunning(project_id.to_string()))
            }
            Some(_) => {
                map.remove(project_id);
                Ok(())
            }
        }
    }

    /// Stop every live server concurrently, bounded by `overall` so daemon
    /// exit can never hang on a wedged child.
    pub async fn shutdown_all(&self, grace: Duration, overall: Duration) {
        let ids: Vec<String> = {
            let map = self.inner.lock().await;
            map.iter()
                .filter(|(_, e)| e.state.is_live())
                .map(|(id, _)| id.clone())
                .collect()
        };
        if ids.is_empty() {
            return;
        }

        info!(count = ids.len(), "stopping all running servers");
        let mut stops = JoinSet::new();
        for id in ids {
            let supervisor = self.clone();
            stops.spawn(async move {
                if let Err(err) = supervisor.stop(&id, grace).await {
                    warn!(%id, "stop during shutdown failed: {err}");
                }
            });
        }

        let drained = tokio::time::timeout(overall, async {
            while stops.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                timeout_ms = overall.as_millis() as u64,
                "shutdown timed out; abandoning remaining waits"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use devport_core::NewProject;

    use super::*;

    const GRACE: Duration = Duration::from_millis(500);

    async fn fixture() -> (Supervisor, ConfigStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json"))
            .await
            .unwrap();
        let supervisor = Supervisor::new(store.clone());
        (supervisor, store, dir)
    }

    async fn register(
        store: &ConfigStore,
        dir: &tempfile::TempDir,
        name: &str,
        command: &str,
        port: Option<u16>,
    ) -> String {
        store
            .add_project(NewProject {
                name: name.to_string(),
                path: dir.path().to_string_lossy().to_string(),
                command: command.to_string(),
                port,
                description: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn wait_until<F, Fut>(mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if probe().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn start_unknown_project_fails() {
        let (supervisor, _store, _dir) = fixture().await;
        match supervisor.start("missing").await {
            Err(SupervisorError::ProjectNotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("expected ProjectNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_never_started_project_fails() {
        let (supervisor, _store, _dir) = fixture().await;
        assert!(matches!(
            supervisor.stop("missing", GRACE).await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn double_start_is_a_noop_with_the_same_port() {
        let (supervisor, store, dir) = fixture().await;
        let id = register(&store, &dir, "sleeper", "sleep 30", None).await;

        let first = supervisor.start(&id).await.unwrap();
        assert!(!first.already_running);

        let second = supervisor.start(&id).await.unwrap();
        assert!(second.already_running);
        assert_eq!(second.port, first.port);

        let running = supervisor.list_running().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].state, ServerState::Running);
        assert_eq!(running[0].port, first.port);

        supervisor.stop(&id, GRACE).await.unwrap();
        assert!(supervisor.list_running().await.is_empty());
    }

    #[tokio::test]
    async fn quiet_server_has_empty_logs() {
        let (supervisor, store, dir) = fixture().await;
        let id = register(&store, &dir, "sleeper", "sleep 30", None).await;

        supervisor.start(&id).await.unwrap();
        assert!(supervisor.get_logs(&id).await.unwrap().is_empty());
        supervisor.stop(&id, GRACE).await.unwrap();
    }

    #[tokio::test]
    async fn crash_is_retained_with_captured_stderr() {
        let (supervisor, store, dir) = fixture().await;
        let id = register(&store, &dir, "broken", "echo boom >&2; exit 3", None).await;

        supervisor.start(&id).await.unwrap();

        let supervisor2 = supervisor.clone();
        let id2 = id.clone();
        assert!(
            wait_until(|| {
                let supervisor = supervisor2.clone();
                let id = id2.clone();
                async move {
                    supervisor
                        .list_running()
                        .await
                        .iter()
                        .any(|s| s.project_id == id && s.state == ServerState::Error)
                }
            })
            .await,
            "server never reached error state"
        );

        let running = supervisor.list_running().await;
        assert_eq!(running[0].exit_code, Some(3));

        let logs = supervisor.get_logs(&id).await.unwrap();
        assert!(logs.contains(&"[stderr] boom".to_string()), "{logs:?}");

        // Not running: stop refuses, clear discards.
        assert!(matches!(
            supervisor.stop(&id, GRACE).await,
            Err(SupervisorError::NotRunning(_))
        ));
        supervisor.clear(&id).await.unwrap();
        assert!(supervisor.list_running().await.is_empty());
        assert!(matches!(
            supervisor.clear(&id).await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn clean_exit_removes_the_entry() {
        let (supervisor, store, dir) = fixture().await;
        let id = register(&store, &dir, "oneshot", "true", None).await;

        supervisor.start(&id).await.unwrap();

        let supervisor2 = supervisor.clone();
        assert!(
            wait_until(|| {
                let supervisor = supervisor2.clone();
                async move { supervisor.list_running().await.is_empty() }
            })
            .await,
            "entry for a clean exit was never removed"
        );
    }

    #[tokio::test]
    async fn restart_supersedes_a_retained_crash() {
        let (supervisor, store, dir) = fixture().await;
        let id = register(&store, &dir, "flaky", "exit 1", None).await;

        supervisor.start(&id).await.unwrap();
        let supervisor2 = supervisor.clone();
        let id2 = id.clone();
        assert!(
            wait_until(|| {
                let supervisor = supervisor2.clone();
                let id = id2.clone();
                async move {
                    supervisor
                        .list_running()
                        .await
                        .iter()
                        .any(|s| s.project_id == id && s.state == ServerState::Error)
                }
            })
            .await
        );

        // The retained entry does not block a fresh start.
        let started = supervisor.start(&id).await.unwrap();
        assert!(!started.already_running);
    }

    #[tokio::test]
    async fn requested_port_in_use_fails_the_start() {
        let (supervisor, store, dir) = fixture().await;
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy_port = holder.local_addr().unwrap().port();
        let id = register(&store, &dir, "pinned", "sleep 30", Some(busy_port)).await;

        assert!(matches!(
            supervisor.start(&id).await,
            Err(SupervisorError::PortUnavailable(_))
        ));
        assert!(supervisor.list_running().await.is_empty());
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill_for_term_ignoring_servers() {
        let (supervisor, store, dir) = fixture().await;
        let id = register(
            &store,
            &dir,
            "holdout",
            "trap '' TERM; while :; do sleep 0.2; done",
            None,
        )
        .await;

        supervisor.start(&id).await.unwrap();
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let before = tokio::time::Instant::now();
        supervisor.stop(&id, GRACE).await.unwrap();
        assert!(before.elapsed() < Duration::from_secs(5));

        let supervisor2 = supervisor.clone();
        assert!(
            wait_until(|| {
                let supervisor = supervisor2.clone();
                async move { supervisor.list_running().await.is_empty() }
            })
            .await,
            "holdout entry was never removed"
        );
    }

    #[tokio::test]
    async fn shutdown_all_is_bounded_and_kills_holdouts() {
        let (supervisor, store, dir) = fixture().await;
        let a = register(&store, &dir, "a", "sleep 30", None).await;
        let b = register(&store, &dir, "b", "sleep 30", None).await;
        let c = register(
            &store,
            &dir,
            "c",
            "trap '' TERM; while :; do sleep 0.2; done",
            None,
        )
        .await;

        supervisor.start(&a).await.unwrap();
        supervisor.start(&b).await.unwrap();
        supervisor.start(&c).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let before = tokio::time::Instant::now();
        supervisor
            .shutdown_all(GRACE, Duration::from_secs(8))
            .await;
        assert!(before.elapsed() < Duration::from_secs(8));

        let supervisor2 = supervisor.clone();
        assert!(
            wait_until(|| {
                let supervisor = supervisor2.clone();
                async move { supervisor.list_running().await.is_empty() }
            })
            .await,
            "servers survived shutdown_all"
        );
    }
}
