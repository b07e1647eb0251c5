//! Scripted engine used by the daemon's unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{
    AnalysisConfiguration, AnalysisEngine, AnalysisResults, EngineError, EngineFactory,
    EngineResult, GlobalConfiguration, Issue, IssueListener, LogLevel, LogOutput, RuleDetails,
    ServerConfiguration, StorageState,
};

/// Host name making mock updates fail.
pub const UNREACHABLE: &str = "http://unreachable.invalid";

/// Shared record of what the mock engines did.
#[derive(Default)]
pub struct Journal {
    events: Mutex<Vec<String>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    analyzing: AtomicUsize,
    max_analyzing: AtomicUsize,
}

impl Journal {
    fn push(&self, event: String) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn max_analyzing(&self) -> usize {
        self.max_analyzing.load(Ordering::SeqCst)
    }
}

/// Behaviour shared by every engine a [`MockFactory`] creates.
#[derive(Clone, Default)]
pub struct MockBehaviour {
    pub issues: Vec<Issue>,
    pub concurrent: bool,
    pub analyze_delay: Option<Duration>,
    pub stop_fails: bool,
}

pub struct MockEngine {
    id: usize,
    server_id: String,
    state: Mutex<StorageState>,
    log: Arc<dyn LogOutput>,
    behaviour: MockBehaviour,
    journal: Arc<Journal>,
}

#[async_trait]
impl AnalysisEngine for MockEngine {
    async fn state(&self) -> StorageState {
        *self.state.lock()
    }

    async fn analyze(
        &self,
        config: &AnalysisConfiguration,
        listener: &dyn IssueListener,
    ) -> EngineResult<AnalysisResults> {
        if *self.state.lock() != StorageState::Updated {
            return Err(EngineError::StorageRequiresUpdate {
                server_id: self.server_id.clone(),
            });
        }
        if config.project_key.as_deref() == Some("unknown") {
            return Err(EngineError::ProjectNotUpdated {
                project_key: "unknown".to_string(),
            });
        }

        self.journal.push(format!("analyze:{}", self.id));
        let now = self.journal.analyzing.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.max_analyzing.fetch_max(now, Ordering::SeqCst);

        self.log.log(
            &format!("Analyzing {} files", config.input_files.len()),
            LogLevel::Info,
        );
        if let Some(delay) = self.behaviour.analyze_delay {
            tokio::time::sleep(delay).await;
        }

        let mut results = AnalysisResults {
            file_count: config.input_files.len(),
            ..Default::default()
        };
        for issue in &self.behaviour.issues {
            let mut issue = issue.clone();
            issue.input_file = config.input_files.first().cloned();
            listener.on_issue(issue).await;
            results.issue_count += 1;
        }

        self.journal.analyzing.fetch_sub(1, Ordering::SeqCst);
        Ok(results)
    }

    async fn update(&self, server: &ServerConfiguration) -> EngineResult<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), StorageState::Updating);
        self.journal.push(format!("update:{}", self.id));
        tokio::task::yield_now().await;

        if server.url.starts_with(UNREACHABLE) {
            *self.state.lock() = match previous {
                StorageState::NeverUpdated => StorageState::NeverUpdated,
                _ => StorageState::NeedUpdate,
            };
            return Err(EngineError::Connection(server.url.clone()));
        }
        *self.state.lock() = StorageState::Updated;
        Ok(())
    }

    async fn update_project(
        &self,
        server: &ServerConfiguration,
        project_key: &str,
    ) -> EngineResult<()> {
        self.journal
            .push(format!("update_project:{}:{}", self.id, project_key));
        if server.url.starts_with(UNREACHABLE) {
            *self.state.lock() = StorageState::NeedUpdate;
            return Err(EngineError::Connection(server.url.clone()));
        }
        Ok(())
    }

    async fn rule_details(&self, rule_key: &str) -> EngineResult<RuleDetails> {
        if rule_key != "js:S1" {
            return Err(EngineError::RuleNotFound(rule_key.to_string()));
        }
        Ok(RuleDetails {
            key: rule_key.to_string(),
            name: "No eval".to_string(),
            language: "js".to_string(),
            severity: "MAJOR".to_string(),
            html_description: "<p>Avoid eval</p>".to_string(),
        })
    }

    async fn stop(&self, delete_storage: bool) -> EngineResult<()> {
        self.journal
            .push(format!("stop:{}:{}", self.id, delete_storage));
        self.journal.live.fetch_sub(1, Ordering::SeqCst);
        if self.behaviour.stop_fails {
            return Err(EngineError::Other("stop failed".to_string()));
        }
        Ok(())
    }

    fn supports_concurrent_analysis(&self) -> bool {
        self.behaviour.concurrent
    }
}

/// Factory producing [`MockEngine`]s numbered from 1.
pub struct MockFactory {
    pub journal: Arc<Journal>,
    pub behaviour: MockBehaviour,
    pub fail_create: AtomicBool,
    created: AtomicUsize,
}

impl MockFactory {
    pub fn new(behaviour: MockBehaviour) -> Arc<Self> {
        Arc::new(Self {
            journal: Arc::new(Journal::default()),
            behaviour,
            fail_create: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EngineFactory for MockFactory {
    async fn create(&self, config: GlobalConfiguration) -> EngineResult<Arc<dyn AnalysisEngine>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Storage(format!(
                "cannot open {}",
                config.home.display()
            )));
        }

        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.push(format!("create:{}:{}", id, config.server_id));
        let live = self.journal.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Arc::new(MockEngine {
            id,
            server_id: config.server_id,
            state: Mutex::new(StorageState::NeverUpdated),
            log: config.log_output,
            behaviour: self.behaviour.clone(),
            journal: Arc::clone(&self.journal),
        }))
    }
}

pub struct NullLog;

impl LogOutput for NullLog {
    fn log(&self, _message: &str, _level: LogLevel) {}
}

pub fn global_config(server_id: &str) -> GlobalConfiguration {
    GlobalConfiguration {
        server_id: server_id.to_string(),
        home: PathBuf::from("/tmp/lint-daemon-test"),
        enabled_languages: vec!["js".to_string()],
        log_output: Arc::new(NullLog),
    }
}

pub fn sample_issue(rule_key: &str, line: u32) -> Issue {
    Issue {
        severity: "MAJOR".to_string(),
        rule_key: rule_key.to_string(),
        rule_name: "No eval".to_string(),
        message: "Remove this use of eval".to_string(),
        start_line: Some(line),
        start_line_offset: Some(0),
        end_line: Some(line),
        end_line_offset: Some(4),
        input_file: None,
    }
}
