//! Remote operations of the daemon.
//!
//! Each operation checks that an engine is registered before anything else,
//! translates its request, delegates, and converts engine failures into
//! [`Error`] values the RPC layer can put on the wire.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::daemon::controller::EngineController;
use crate::daemon::diagnostics::DiagnosticRelay;
use crate::daemon::log_relay::{LogRelay, LogSubscription};
use crate::daemon::translate::{self, RegistrationDefaults};
use crate::engine::{AnalysisResults, EngineError, EngineFactory};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, Timer};
use crate::rpc::protocol as wire;

/// The daemon: one engine, one log relay, one shutdown signal.
pub struct ConnectedDaemon {
    controller: EngineController,
    log_relay: Arc<LogRelay>,
    defaults: RegistrationDefaults,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl ConnectedDaemon {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        defaults: RegistrationDefaults,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            controller: EngineController::new(factory),
            log_relay: LogRelay::new(Arc::clone(&metrics)),
            defaults,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_registered(&self) -> bool {
        self.controller.is_registered()
    }

    /// Cancelled once `shutdown` has been acknowledged.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ===== Operations =====

    /// Start a new engine, stopping the current one.
    pub async fn register(&self, req: wire::ConnectedConfiguration) -> Result<()> {
        let config =
            translate::global_configuration(&req, &self.defaults, self.log_relay.clone())?;
        info!(
            "Registering storage '{}' (home: {}, languages: {})",
            config.server_id,
            config.home.display(),
            config.enabled_languages.join(",")
        );

        self.controller.register(config).await?;
        self.metrics.inc_registrations();
        Ok(())
    }

    /// Analyze files, sending each issue to `issues` as the engine finds it.
    ///
    /// Returns once the engine is done. If the receiving side of `issues` is
    /// dropped, remaining issues are discarded and the analysis still
    /// completes.
    pub async fn analyze(
        &self,
        req: wire::ConnectedAnalysisReq,
        issues: mpsc::Sender<wire::Issue>,
    ) -> Result<AnalysisResults> {
        let engine = self.controller.acquire().await?;
        let config = translate::analysis_configuration(&req)?;

        let _permit = engine.analysis_permit().await;
        let timer = Timer::start();
        debug!(
            "Analyzing {} files in {}",
            config.input_files.len(),
            config.base_dir.display()
        );

        let relay = DiagnosticRelay::new(issues, Arc::clone(&self.metrics));
        let results = engine
            .analyze(&config, &relay)
            .await
            .map_err(|e| engine_error("analyze", e))?;

        self.metrics.inc_analyses();
        if relay.is_closed() {
            debug!("Caller left before the analysis ended");
        }
        info!(
            "Analysis finished in {}ms: {} issues ({} delivered), {} files ({} skipped)",
            timer.elapsed_ms(),
            results.issue_count,
            relay.forwarded(),
            results.file_count,
            results.skipped_count
        );
        Ok(results)
    }

    /// Attach the caller as the log subscriber, displacing any previous one.
    pub fn stream_logs(&self) -> Result<LogSubscription> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let (subscription, displaced) = self.log_relay.attach();
        if let Some(displaced) = displaced {
            info!(
                "Log subscriber {} replaced by {}",
                displaced.id(),
                subscription.id()
            );
        }
        Ok(subscription)
    }

    /// Refresh the global storage.
    pub async fn update(&self, config: wire::ServerConfig) -> Result<()> {
        let engine = self.controller.acquire().await?;
        let server = translate::server_configuration(&config)?;

        info!("Updating storage from {}", server.url);
        engine
            .update(&server)
            .await
            .map_err(|e| engine_error("update", e))
    }

    /// Refresh the storage of one project.
    pub async fn update_project(&self, req: wire::ModuleUpdateReq) -> Result<()> {
        let engine = self.controller.acquire().await?;
        let project_key = translate::non_empty(&req.module_key)
            .ok_or_else(|| Error::InvalidParams("moduleKey is required".to_string()))?;
        let server = translate::server_configuration(&req.server_config)?;

        info!("Updating project '{}' from {}", project_key, server.url);
        engine
            .update_project(&server, &project_key)
            .await
            .map_err(|e| engine_error("updateProject", e))
    }

    pub async fn get_status(&self) -> Result<wire::StorageState> {
        let state = self.controller.status().await?;
        Ok(wire::StorageState {
            state: translate::storage_state(state),
        })
    }

    pub async fn get_rule_detail(&self, req: wire::RuleKey) -> Result<wire::RuleDetails> {
        let engine = self.controller.acquire().await?;
        let key = translate::non_empty(&req.key)
            .ok_or_else(|| Error::InvalidParams("key is required".to_string()))?;

        engine
            .rule_details(&key)
            .await
            .map(translate::rule_details)
            .map_err(|e| engine_error("getRuleDetail", e))
    }

    /// Acknowledge a shutdown request, then signal the process to stop.
    ///
    /// `acknowledge` must complete once the caller has been answered.
    /// Teardown of the engine happens later, in [`teardown`](Self::teardown).
    pub async fn shutdown<F>(&self, acknowledge: F)
    where
        F: Future<Output = ()>,
    {
        info!("Shutdown requested");
        acknowledge.await;
        self.shutdown.cancel();
    }

    /// Stop the engine and end the log stream. Idempotent.
    pub async fn teardown(&self) {
        self.shutdown.cancel();
        self.controller.shutdown().await;
        self.log_relay.close();
        info!("Daemon stopped");
    }
}

/// Map an engine failure to the daemon taxonomy.
fn engine_error(operation: &str, err: EngineError) -> Error {
    match err {
        EngineError::StorageRequiresUpdate { server_id } => Error::StorageRequiresUpdate {
            storage_id: server_id,
        },
        EngineError::ProjectNotUpdated { project_key } => {
            Error::ProjectStorageRequiresUpdate { project_key }
        }
        EngineError::RuleNotFound(key) => Error::RuleNotFound(key),
        other => {
            error!("Engine failure during {}: {:?}", operation, other);
            Error::engine(operation, other.to_string())
        }
    }
}
