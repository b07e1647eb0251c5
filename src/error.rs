//! Error types for the lint daemon.

use serde_json::{json, Value};
use thiserror::Error;

use crate::rpc::protocol::error_codes;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Lifecycle Errors =====
    #[error("Engine not registered: call 'register' first")]
    NotRegistered,

    #[error("Failed to register engine for storage '{storage_id}': {message}")]
    Registration { storage_id: String, message: String },

    #[error("Daemon is shutting down")]
    ShuttingDown,

    // ===== Storage Errors =====
    #[error("Storage of server '{storage_id}' requires an update")]
    StorageRequiresUpdate { storage_id: String },

    #[error("Storage of project '{project_key}' requires an update")]
    ProjectStorageRequiresUpdate { project_key: String },

    // ===== Translation Errors =====
    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid server configuration: {0}")]
    InvalidServerConfig(String),

    // ===== Engine Errors =====
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Engine failure during {operation}: {message}")]
    Engine { operation: String, message: String },

    // ===== RPC Errors =====
    #[error("RPC protocol error: {0}")]
    Protocol(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cancelled: operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Create an engine failure for the given operation.
    pub fn engine(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether the caller can recover by calling `register`.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::NotRegistered | Self::ShuttingDown)
    }

    /// Whether the caller must refresh storage with `update`/`updateProject`.
    pub fn is_stale_storage(&self) -> bool {
        matches!(
            self,
            Self::StorageRequiresUpdate { .. } | Self::ProjectStorageRequiresUpdate { .. }
        )
    }

    /// JSON-RPC error code for this error.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::NotRegistered | Self::ShuttingDown => error_codes::PRECONDITION_FAILED,
            Self::Registration { .. } => error_codes::REGISTRATION_FAILED,
            Self::StorageRequiresUpdate { .. } | Self::ProjectStorageRequiresUpdate { .. } => {
                error_codes::STORAGE_REQUIRES_UPDATE
            }
            Self::RuleNotFound(_) => error_codes::NOT_FOUND,
            Self::InvalidPath(_) | Self::InvalidServerConfig(_) | Self::InvalidParams(_) => {
                error_codes::INVALID_PARAMS
            }
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::Protocol(_) => error_codes::INVALID_REQUEST,
            Self::Cancelled => error_codes::REQUEST_CANCELLED,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Structured details attached to the wire error, if any.
    pub fn rpc_data(&self) -> Option<Value> {
        match self {
            Self::StorageRequiresUpdate { storage_id } => Some(json!({ "storageId": storage_id })),
            Self::ProjectStorageRequiresUpdate { project_key } => {
                Some(json!({ "projectKey": project_key }))
            }
            Self::RuleNotFound(key) => Some(json!({ "ruleKey": key })),
            _ => None,
        }
    }
}
