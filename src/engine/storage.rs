//! Local storage cache of server rules and project profiles.
//!
//! Layout under the engine home:
//!
//! ```text
//! storage/<encoded server id>/global.json
//! storage/<encoded server id>/projects/<encoded project key>.json
//! ```

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::engine::{EngineError, EngineResult, RuleDetails};

/// Version of the on-disk format; storage written by another version needs an update.
pub const STORAGE_VERSION: u32 = 2;

const GLOBAL_FILE: &str = "global.json";
const PROJECTS_DIR: &str = "projects";

/// A rule as stored after a global update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRule {
    pub key: String,
    pub name: String,
    pub language: String,
    pub severity: String,
    #[serde(default)]
    pub html_description: String,
    /// Default parameter values
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl StoredRule {
    pub fn details(&self) -> RuleDetails {
        RuleDetails {
            key: self.key.clone(),
            name: self.name.clone(),
            language: self.language.clone(),
            severity: self.severity.clone(),
            html_description: self.html_description.clone(),
        }
    }
}

/// Server-wide data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStorage {
    pub version: u32,
    pub server_url: String,
    #[serde(default)]
    pub server_version: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub rules: Vec<StoredRule>,
}

impl GlobalStorage {
    pub fn new(server_url: impl Into<String>, rules: Vec<StoredRule>) -> Self {
        Self {
            version: STORAGE_VERSION,
            server_url: server_url.into(),
            server_version: None,
            updated_at: Utc::now(),
            rules,
        }
    }

    pub fn rule(&self, key: &str) -> Option<&StoredRule> {
        self.rules.iter().find(|r| r.key == key)
    }

    pub fn is_current(&self) -> bool {
        self.version == STORAGE_VERSION
    }
}

/// A rule activated in one of the project's quality profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRule {
    pub rule_key: String,
    pub severity: String,
    /// Parameter values overriding the rule defaults
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Data of one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStorage {
    pub version: u32,
    pub project_key: String,
    pub updated_at: DateTime<Utc>,
    pub active_rules: Vec<ActiveRule>,
}

impl ProjectStorage {
    pub fn new(project_key: impl Into<String>, active_rules: Vec<ActiveRule>) -> Self {
        Self {
            version: STORAGE_VERSION,
            project_key: project_key.into(),
            updated_at: Utc::now(),
            active_rules,
        }
    }
}

/// File-backed storage of one server.
#[derive(Debug, Clone)]
pub struct StorageManager {
    root: PathBuf,
}

fn encode_name(name: &str) -> String {
    utf8_percent_encode(name, NON_ALPHANUMERIC).to_string()
}

impl StorageManager {
    /// Storage of `server_id` under `home`.
    pub fn new(home: &Path, server_id: &str) -> Self {
        Self {
            root: home.join("storage").join(encode_name(server_id)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn global_path(&self) -> PathBuf {
        self.root.join(GLOBAL_FILE)
    }

    fn project_path(&self, project_key: &str) -> PathBuf {
        self.root
            .join(PROJECTS_DIR)
            .join(format!("{}.json", encode_name(project_key)))
    }

    /// Create the storage directory if needed.
    pub async fn ensure_root(&self) -> EngineResult<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub async fn read_global(&self) -> EngineResult<Option<GlobalStorage>> {
        read_json(&self.global_path()).await
    }

    pub async fn write_global(&self, storage: &GlobalStorage) -> EngineResult<()> {
        write_json(&self.global_path(), storage).await
    }

    pub async fn read_project(&self, project_key: &str) -> EngineResult<Option<ProjectStorage>> {
        read_json(&self.project_path(project_key)).await
    }

    pub async fn write_project(&self, storage: &ProjectStorage) -> EngineResult<()> {
        write_json(&self.project_path(&storage.project_key), storage).await
    }

    /// Delete everything stored for this server.
    pub async fn delete(&self) -> EngineResult<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| EngineError::Storage(format!("{}: {}", path.display(), e)))
}

/// Write through a temporary file so readers never see a partial document.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::Storage(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    debug!("Wrote storage file {}", path.display());
    Ok(())
}
