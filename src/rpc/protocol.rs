//! Wire protocol types and message definitions.
//!
//! Calls are JSON-RPC 2.0 requests. Server-streaming calls emit one
//! `stream/item` notification per item before their terminal response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// JSON-RPC version.
pub const JSONRPC_VERSION: &str = "2.0";

// ===== JSON-RPC Base Types =====

/// A JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    /// `Some(Value::Null)` for a successfully completed stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&crate::error::Error> for JsonRpcError {
    fn from(err: &crate::error::Error) -> Self {
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
            data: err.rpc_data(),
        }
    }
}

/// Request ID (can be string or number). `Null` answers messages whose id
/// could not be read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
    Null,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Null => write!(f, "null"),
        }
    }
}

// ===== Methods =====

/// Method names.
pub mod methods {
    pub const REGISTER: &str = "register";
    pub const ANALYZE: &str = "analyze";
    pub const STREAM_LOGS: &str = "streamLogs";
    pub const UPDATE: &str = "update";
    pub const UPDATE_PROJECT: &str = "updateProject";
    pub const UPDATE_MODULE: &str = "updateModule";
    pub const GET_STATUS: &str = "getStatus";
    pub const GET_STATE: &str = "getState";
    pub const GET_RULE_DETAIL: &str = "getRuleDetail";
    pub const GET_RULE_DETAILS: &str = "getRuleDetails";
    pub const SHUTDOWN: &str = "shutdown";
    pub const PING: &str = "ping";

    /// Notification carrying one item of a server-streaming call.
    pub const STREAM_ITEM: &str = "stream/item";
    /// Notification cancelling an in-flight call.
    pub const CANCELLED: &str = "notifications/cancelled";

    /// Whether the method answers with a stream of items.
    pub fn is_streaming(method: &str) -> bool {
        matches!(method, ANALYZE | STREAM_LOGS)
    }
}

// ===== Daemon Messages =====

/// `register` params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedConfiguration {
    #[serde(default)]
    pub storage_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_languages: Vec<String>,
}

/// One file of an analysis request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFile {
    pub path: String,
    #[serde(default)]
    pub charset: String,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub user_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// `analyze` params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedAnalysisReq {
    #[serde(default)]
    pub module_key: String,
    #[serde(default)]
    pub base_dir: String,
    #[serde(default)]
    pub files: Vec<InputFile>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Login/password pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

/// `update` params. At most one of `credentials` and `token` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub host_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// `updateProject` params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleUpdateReq {
    #[serde(default)]
    pub module_key: String,
    #[serde(default)]
    pub server_config: ServerConfig,
}

/// Storage state as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    NeverUpdated,
    NeedUpdate,
    Updating,
    Updated,
    Unknown,
}

/// `getStatus` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageState {
    pub state: State,
}

/// `getRuleDetail` params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleKey {
    #[serde(default)]
    pub key: String,
}

/// `getRuleDetail` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDetails {
    pub key: String,
    pub name: String,
    pub language: String,
    pub severity: String,
    pub html_description: String,
}

/// One streamed `analyze` item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub severity: String,
    pub rule_key: String,
    pub rule_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line_offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line_offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
}

/// One streamed `streamLogs` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub level: String,
    pub log: String,
    pub is_debug: bool,
}

/// `stream/item` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamItem {
    pub request_id: RequestId,
    pub item: Value,
}

/// `notifications/cancelled` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ===== Error Codes =====

/// JSON-RPC error codes, standard and daemon-specific.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// No engine registered, or the daemon is shutting down.
    pub const PRECONDITION_FAILED: i32 = -32001;
    /// Engine construction failed.
    pub const REGISTRATION_FAILED: i32 = -32002;
    /// Storage must be refreshed with `update` or `updateProject`.
    pub const STORAGE_REQUIRES_UPDATE: i32 = -32003;
    pub const NOT_FOUND: i32 = -32004;
    /// The caller cancelled the call before it completed.
    pub const REQUEST_CANCELLED: i32 = -32800;
}
