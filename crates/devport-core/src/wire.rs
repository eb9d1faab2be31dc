//! Wire protocol for the daemon socket: newline-delimited JSON, one request
//! per line, one response per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_PING: &str = "ping";
pub const METHOD_SHUTDOWN: &str = "shutdown";

pub const METHOD_GET_CONFIG: &str = "get-config";
pub const METHOD_GET_PROJECTS: &str = "get-projects";
pub const METHOD_ADD_PROJECT: &str = "add-project";
pub const METHOD_UPDATE_PROJECT: &str = "update-project";
pub const METHOD_DELETE_PROJECT: &str = "delete-project";

pub const METHOD_START_SERVER: &str = "start-server";
pub const METHOD_STOP_SERVER: &str = "stop-server";
pub const METHOD_GET_RUNNING_SERVERS: &str = "get-running-servers";
pub const METHOD_GET_SERVER_LOGS: &str = "get-server-logs";
pub const METHOD_TAIL_SERVER_LOGS: &str = "tail-server-logs";
pub const METHOD_CLEAR_SERVER: &str = "clear-server";

pub const METHOD_ADD_QUICK_ACCESS_SITE: &str = "add-quick-access-site";
pub const METHOD_UPDATE_QUICK_ACCESS_SITE: &str = "update-quick-access-site";
pub const METHOD_DELETE_QUICK_ACCESS_SITE: &str = "delete-quick-access-site";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Params for operations addressing one project's server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectIdParams {
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailLogsParams {
    pub project_id: String,
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProjectParams {
    pub id: String,
    #[serde(flatten)]
    pub updates: crate::ProjectUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdParams {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateQuickAccessSiteParams {
    pub id: String,
    #[serde(flatten)]
    pub updates: crate::QuickAccessSiteUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_params_default_to_null() {
        let req: Request = serde_json::from_str(r#"{"id":7,"method":"ping"}"#).unwrap();
        assert_eq!(req.id, 7);
        assert_eq!(req.method, METHOD_PING);
        assert!(req.params.is_null());
    }

    #[test]
    fn ok_response_omits_error_field() {
        let json = serde_json::to_string(&Response::ok(1, serde_json::json!({"port": 3000}))).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"data\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn err_response_omits_data_field() {
        let json = serde_json::to_string(&Response::err(2, "project not found")).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("project not found"));
        assert!(!json.contains("\"data\""));
    }
}
