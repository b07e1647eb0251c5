//! Built-in connected engine.
//!
//! Keeps a local copy of the server's rules and of each project's active
//! rules, and evaluates rules that carry a regular-expression parameter
//! line by line over the analyzed files.

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::server_api::ServerApi;
use crate::engine::storage::{GlobalStorage, ProjectStorage, StorageManager, StoredRule};
use crate::engine::{
    AnalysisConfiguration, AnalysisEngine, AnalysisResults, EngineError, EngineFactory,
    EngineResult, GlobalConfiguration, Issue, IssueListener, LogLevel, LogOutput, RuleDetails,
    ServerConfiguration, StorageState,
};

/// Rule parameters holding the pattern to search for.
const PATTERN_PARAMS: &[&str] = &["regularExpression", "pattern"];

/// Rule parameter overriding the issue message.
const MESSAGE_PARAM: &str = "message";

/// File suffixes per language key.
const LANGUAGE_SUFFIXES: &[(&str, &[&str])] = &[
    ("js", &["js", "jsx", "mjs", "cjs", "vue"]),
    ("ts", &["ts", "tsx", "mts", "cts"]),
    ("css", &["css", "less", "scss"]),
    ("web", &["html", "htm", "xhtml"]),
    ("py", &["py"]),
    ("java", &["java"]),
    ("kotlin", &["kt", "kts"]),
    ("go", &["go"]),
    ("php", &["php"]),
    ("ruby", &["rb"]),
    ("xml", &["xml"]),
];

/// Detect a file's language key from its suffix.
pub fn detect_language(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    LANGUAGE_SUFFIXES
        .iter()
        .find(|(_, suffixes)| suffixes.contains(&ext.as_str()))
        .map(|(language, _)| *language)
}

/// A rule ready to be evaluated.
#[derive(Debug)]
struct CompiledRule {
    key: String,
    name: String,
    language: String,
    severity: String,
    pattern: Regex,
    message: String,
}

impl CompiledRule {
    /// Returns `None` for rules without a usable pattern.
    fn compile(
        rule: &StoredRule,
        severity: &str,
        overrides: &BTreeMap<String, String>,
        log: &dyn LogOutput,
    ) -> Option<Self> {
        let param = |name: &str| overrides.get(name).or_else(|| rule.params.get(name));
        let source = PATTERN_PARAMS.iter().find_map(|name| param(*name))?;

        match Regex::new(source) {
            Ok(pattern) => Some(Self {
                key: rule.key.clone(),
                name: rule.name.clone(),
                language: rule.language.clone(),
                severity: severity.to_string(),
                pattern,
                message: param(MESSAGE_PARAM)
                    .cloned()
                    .unwrap_or_else(|| rule.name.clone()),
            }),
            Err(e) => {
                log.log(
                    &format!("Skipping rule '{}': invalid pattern: {}", rule.key, e),
                    LogLevel::Warn,
                );
                None
            }
        }
    }
}

/// Engine backed by a local storage cache of one server.
pub struct ConnectedEngine {
    server_id: String,
    languages: Vec<String>,
    storage: StorageManager,
    log: Arc<dyn LogOutput>,
    state: RwLock<StorageState>,
    global: RwLock<Option<Arc<GlobalStorage>>>,
    /// Serializes storage updates.
    update_lock: Mutex<()>,
}

impl ConnectedEngine {
    /// Open the storage of the configured server and derive the initial state.
    pub async fn start(config: GlobalConfiguration) -> EngineResult<Self> {
        let storage = StorageManager::new(&config.home, &config.server_id);
        storage.ensure_root().await?;

        let global = match storage.read_global().await {
            Ok(global) => global,
            Err(EngineError::Storage(e)) => {
                config.log_output.log(
                    &format!("Ignoring unreadable storage: {}", e),
                    LogLevel::Warn,
                );
                None
            }
            Err(e) => return Err(e),
        };

        let state = match &global {
            None => StorageState::NeverUpdated,
            Some(g) if !g.is_current() => StorageState::NeedUpdate,
            Some(_) => StorageState::Updated,
        };

        config.log_output.log(
            &format!(
                "Started engine for server '{}' (storage {:?}, languages {:?})",
                config.server_id, state, config.enabled_languages
            ),
            LogLevel::Info,
        );

        Ok(Self {
            server_id: config.server_id,
            languages: config.enabled_languages,
            storage,
            log: config.log_output,
            state: RwLock::new(state),
            global: RwLock::new(global.filter(|g| g.is_current()).map(Arc::new)),
            update_lock: Mutex::new(()),
        })
    }

    fn set_state(&self, state: StorageState) -> StorageState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    fn global(&self) -> EngineResult<Arc<GlobalStorage>> {
        self.global
            .read()
            .clone()
            .ok_or_else(|| EngineError::StorageRequiresUpdate {
                server_id: self.server_id.clone(),
            })
    }

    fn is_enabled(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l == language)
    }

    async fn fetch_global(&self, server: &ServerConfiguration) -> EngineResult<GlobalStorage> {
        let api = ServerApi::new(server)?;
        let status = api.system_status().await?;
        let rules = api.search_rules(&self.languages).await?;

        let mut global = GlobalStorage::new(server.url.clone(), rules);
        global.server_version = status.version;
        self.storage.write_global(&global).await?;
        Ok(global)
    }

    async fn fetch_project(
        &self,
        server: &ServerConfiguration,
        project_key: &str,
    ) -> EngineResult<ProjectStorage> {
        let api = ServerApi::new(server)?;
        let mut active_rules = Vec::new();

        for profile in api.project_profiles(project_key).await? {
            if !self.is_enabled(&profile.language) {
                debug!("Skipping profile {} ({})", profile.key, profile.language);
                continue;
            }
            active_rules.extend(api.active_rules(&profile.key).await?);
        }

        let project = ProjectStorage::new(project_key, active_rules);
        self.storage.write_project(&project).await?;
        Ok(project)
    }

    /// Rules applying to an analysis of `project_key`.
    async fn rules_for(&self, project_key: Option<&str>) -> EngineResult<Vec<CompiledRule>> {
        let global = self.global()?;
        let log = self.log.as_ref();

        let rules = match project_key {
            Some(key) => {
                let project = self.storage.read_project(key).await?.ok_or_else(|| {
                    EngineError::ProjectNotUpdated {
                        project_key: key.to_string(),
                    }
                })?;
                project
                    .active_rules
                    .iter()
                    .filter_map(|active| {
                        let rule = global.rule(&active.rule_key)?;
                        CompiledRule::compile(rule, &active.severity, &active.params, log)
                    })
                    .collect()
            }
            None => global
                .rules
                .iter()
                .filter_map(|rule| CompiledRule::compile(rule, &rule.severity, &BTreeMap::new(), log))
                .collect(),
        };

        Ok(rules)
    }
}

#[async_trait]
impl AnalysisEngine for ConnectedEngine {
    async fn state(&self) -> StorageState {
        *self.state.read()
    }

    async fn analyze(
        &self,
        config: &AnalysisConfiguration,
        listener: &dyn IssueListener,
    ) -> EngineResult<AnalysisResults> {
        if *self.state.read() != StorageState::Updated {
            return Err(EngineError::StorageRequiresUpdate {
                server_id: self.server_id.clone(),
            });
        }

        let rules = self.rules_for(config.project_key.as_deref()).await?;
        self.log.log(
            &format!(
                "Analyzing {} files with {} rules",
                config.input_files.len(),
                rules.len()
            ),
            LogLevel::Info,
        );

        let mut results = AnalysisResults::default();

        for file in &config.input_files {
            let language = file
                .language
                .as_deref()
                .or_else(|| detect_language(&file.path))
                .filter(|language| self.is_enabled(language));
            let Some(language) = language else {
                self.log.log(
                    &format!("Skipping {}: language not enabled", file.path.display()),
                    LogLevel::Debug,
                );
                results.skipped_count += 1;
                continue;
            };

            let bytes = match fs::read(&file.path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.log.log(
                        &format!("Unable to read {}: {}", file.path.display(), e),
                        LogLevel::Warn,
                    );
                    results.skipped_count += 1;
                    continue;
                }
            };

            let (text, _, malformed) = file.charset.decode(&bytes);
            if malformed {
                self.log.log(
                    &format!(
                        "{} contains bytes invalid in {}",
                        file.path.display(),
                        file.charset.name()
                    ),
                    LogLevel::Warn,
                );
            }

            self.log.log(
                &format!("Analyzing {} ({})", file.path.display(), language),
                LogLevel::Debug,
            );

            for (index, line) in text.lines().enumerate() {
                let line_number = index as u32 + 1;
                for rule in rules.iter().filter(|r| r.language == language) {
                    for found in rule.pattern.find_iter(line) {
                        if found.as_str().is_empty() {
                            continue;
                        }
                        let issue = Issue {
                            severity: rule.severity.clone(),
                            rule_key: rule.key.clone(),
                            rule_name: rule.name.clone(),
                            message: rule.message.clone(),
                            start_line: Some(line_number),
                            start_line_offset: Some(line[..found.start()].chars().count() as u32),
                            end_line: Some(line_number),
                            end_line_offset: Some(line[..found.end()].chars().count() as u32),
                            input_file: Some(file.clone()),
                        };
                        listener.on_issue(issue).await;
                        results.issue_count += 1;
                    }
                }
            }

            results.file_count += 1;
        }

        self.log.log(
            &format!(
                "Found {} issues in {} files ({} skipped)",
                results.issue_count, results.file_count, results.skipped_count
            ),
            LogLevel::Info,
        );
        Ok(results)
    }

    async fn update(&self, server: &ServerConfiguration) -> EngineResult<()> {
        let _guard = self.update_lock.lock().await;
        let previous = self.set_state(StorageState::Updating);
        self.log.log(
            &format!("Updating storage of server '{}' from {}", self.server_id, server.url),
            LogLevel::Info,
        );

        match self.fetch_global(server).await {
            Ok(global) => {
                let rule_count = global.rules.len();
                *self.global.write() = Some(Arc::new(global));
                self.set_state(StorageState::Updated);
                self.log.log(
                    &format!("Stored {} rules for server '{}'", rule_count, self.server_id),
                    LogLevel::Info,
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(match previous {
                    StorageState::NeverUpdated => StorageState::NeverUpdated,
                    _ => StorageState::NeedUpdate,
                });
                self.log.log(&format!("Update failed: {}", e), LogLevel::Error);
                Err(e)
            }
        }
    }

    async fn update_project(
        &self,
        server: &ServerConfiguration,
        project_key: &str,
    ) -> EngineResult<()> {
        let _guard = self.update_lock.lock().await;
        if self.global.read().is_none() {
            return Err(EngineError::StorageRequiresUpdate {
                server_id: self.server_id.clone(),
            });
        }

        let previous = self.set_state(StorageState::Updating);
        self.log.log(
            &format!("Updating storage of project '{}'", project_key),
            LogLevel::Info,
        );

        match self.fetch_project(server, project_key).await {
            Ok(project) => {
                self.set_state(previous);
                self.log.log(
                    &format!(
                        "Stored {} active rules for project '{}'",
                        project.active_rules.len(),
                        project_key
                    ),
                    LogLevel::Info,
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(StorageState::NeedUpdate);
                self.log.log(
                    &format!("Update of project '{}' failed: {}", project_key, e),
                    LogLevel::Error,
                );
                Err(e)
            }
        }
    }

    async fn rule_details(&self, rule_key: &str) -> EngineResult<RuleDetails> {
        self.global()?
            .rule(rule_key)
            .map(StoredRule::details)
            .ok_or_else(|| EngineError::RuleNotFound(rule_key.to_string()))
    }

    async fn stop(&self, delete_storage: bool) -> EngineResult<()> {
        self.log.log(
            &format!("Stopping engine for server '{}'", self.server_id),
            LogLevel::Info,
        );
        *self.global.write() = None;
        self.set_state(StorageState::Unknown);
        if delete_storage {
            warn!("Deleting storage at {}", self.storage.root().display());
            self.storage.delete().await?;
        }
        Ok(())
    }

    fn supports_concurrent_analysis(&self) -> bool {
        true
    }
}

/// Factory for [`ConnectedEngine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectedEngineFactory;

#[async_trait]
impl EngineFactory for ConnectedEngineFactory {
    async fn create(&self, config: GlobalConfiguration) -> EngineResult<Arc<dyn AnalysisEngine>> {
        let engine = ConnectedEngine::start(config).await?;
        Ok(Arc::new(engine))
    }
}
