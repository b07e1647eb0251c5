//! Contracts of the embedded analysis engine.
//!
//! The daemon never analyzes code itself. It drives an engine through the
//! [`AnalysisEngine`] trait, creates engines through an [`EngineFactory`], and
//! receives push notifications through [`IssueListener`] and [`LogOutput`].
//!
//! # Architecture
//!
//! - `connected` - Built-in engine backed by a local storage cache
//! - `server_api` - HTTP client for the rule/quality-profile server
//! - `storage` - On-disk storage cache used by the built-in engine

pub mod connected;
pub mod server_api;
pub mod storage;

use async_trait::async_trait;
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use connected::{ConnectedEngine, ConnectedEngineFactory};

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failures reported by an engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage of server '{server_id}' requires an update")]
    StorageRequiresUpdate { server_id: String },

    #[error("No data stored for project '{project_key}': an update is required")]
    ProjectNotUpdated { project_key: String },

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Server returned {status} for {url}: {message}")]
    Server {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Unable to reach server: {0}")]
    Connection(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// State of the engine's local storage, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageState {
    NeverUpdated,
    NeedUpdate,
    Updating,
    Updated,
    Unknown,
}

/// Severity of an engine log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Trace and debug lines are flagged as debug on the wire.
    pub fn is_debug(self) -> bool {
        matches!(self, LogLevel::Trace | LogLevel::Debug)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for log lines emitted by an engine.
///
/// Engines may call this from any thread at any time, including outside of
/// any RPC call, so implementations must not block.
pub trait LogOutput: Send + Sync {
    fn log(&self, message: &str, level: LogLevel);
}

/// Receives the issues of one analysis, in the order the engine finds them.
///
/// The engine awaits each call, so a slow listener suspends the analysis.
#[async_trait]
pub trait IssueListener: Send + Sync {
    async fn on_issue(&self, issue: Issue);
}

/// Engine-wide configuration, fixed for the lifetime of one engine.
#[derive(Clone)]
pub struct GlobalConfiguration {
    /// Identifier of the server storage this engine works against
    pub server_id: String,
    /// Directory holding the local storage cache
    pub home: PathBuf,
    /// Language keys the engine analyzes
    pub enabled_languages: Vec<String>,
    /// Destination of engine log lines
    pub log_output: Arc<dyn LogOutput>,
}

impl fmt::Debug for GlobalConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalConfiguration")
            .field("server_id", &self.server_id)
            .field("home", &self.home)
            .field("enabled_languages", &self.enabled_languages)
            .finish_non_exhaustive()
    }
}

/// How to authenticate against the rule server.
#[derive(Clone, PartialEq, Eq)]
pub enum ServerAuth {
    Anonymous,
    Credentials { login: String, password: String },
    Token(String),
}

impl fmt::Debug for ServerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAuth::Anonymous => f.write_str("Anonymous"),
            ServerAuth::Credentials { login, .. } => f
                .debug_struct("Credentials")
                .field("login", login)
                .field("password", &"***")
                .finish(),
            ServerAuth::Token(_) => f.debug_tuple("Token").field(&"***").finish(),
        }
    }
}

/// Connection to the rule/quality-profile server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfiguration {
    pub url: String,
    pub user_agent: String,
    pub auth: ServerAuth,
}

impl ServerConfiguration {
    /// Anonymous connection with the daemon's user agent.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: crate::USER_AGENT.to_string(),
            auth: ServerAuth::Anonymous,
        }
    }

    pub fn with_auth(mut self, auth: ServerAuth) -> Self {
        self.auth = auth;
        self
    }
}

/// One file to analyze.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInputFile {
    /// Absolute path, already resolved against the base directory
    pub path: PathBuf,
    pub is_test: bool,
    pub charset: &'static Encoding,
    /// Opaque client value echoed back on the file's issues
    pub user_tag: String,
    /// Language override; the engine detects the language when absent
    pub language: Option<String>,
}

/// Parameters of one analysis.
#[derive(Debug, Clone, Default)]
pub struct AnalysisConfiguration {
    pub project_key: Option<String>,
    pub base_dir: PathBuf,
    pub input_files: Vec<ClientInputFile>,
    pub extra_properties: HashMap<String, String>,
}

/// A finding reported during analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub severity: String,
    pub rule_key: String,
    pub rule_name: String,
    pub message: String,
    pub start_line: Option<u32>,
    pub start_line_offset: Option<u32>,
    pub end_line: Option<u32>,
    pub end_line_offset: Option<u32>,
    pub input_file: Option<ClientInputFile>,
}

/// Description of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDetails {
    pub key: String,
    pub name: String,
    pub language: String,
    pub severity: String,
    pub html_description: String,
}

/// Summary returned when an analysis completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisResults {
    pub file_count: usize,
    pub skipped_count: usize,
    pub issue_count: usize,
}

/// A live analysis engine.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Current state of the local storage.
    async fn state(&self) -> StorageState;

    /// Analyze files, reporting each issue to `listener` before returning.
    async fn analyze(
        &self,
        config: &AnalysisConfiguration,
        listener: &dyn IssueListener,
    ) -> EngineResult<AnalysisResults>;

    /// Refresh the global storage from the server.
    async fn update(&self, server: &ServerConfiguration) -> EngineResult<()>;

    /// Refresh the storage of one project from the server.
    async fn update_project(
        &self,
        server: &ServerConfiguration,
        project_key: &str,
    ) -> EngineResult<()>;

    async fn rule_details(&self, rule_key: &str) -> EngineResult<RuleDetails>;

    /// Release the engine, optionally deleting its storage.
    async fn stop(&self, delete_storage: bool) -> EngineResult<()>;

    /// Whether `analyze` may run concurrently on this engine.
    fn supports_concurrent_analysis(&self) -> bool {
        false
    }
}

/// Creates engines from a global configuration.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, config: GlobalConfiguration) -> EngineResult<Arc<dyn AnalysisEngine>>;
}
