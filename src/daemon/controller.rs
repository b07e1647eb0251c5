//! Lifecycle of the single engine instance.
//!
//! The engine lives in a read-write locked slot. `register` and `shutdown`
//! take the write side; every other call holds a read lease for its whole
//! duration, so a replacement waits for in-flight calls and no call sees a
//! half-replaced engine.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use tracing::{error, info, warn};

use crate::engine::{AnalysisEngine, EngineFactory, GlobalConfiguration, StorageState};
use crate::error::{Error, Result};

type Slot = Option<Arc<dyn AnalysisEngine>>;

/// Owner of the engine handle.
pub struct EngineController {
    slot: Arc<RwLock<Slot>>,
    factory: Arc<dyn EngineFactory>,
    /// Serializes analyses on engines that can't run them concurrently.
    analysis_lock: Arc<Mutex<()>>,
    closed: AtomicBool,
}

/// Shared access to the engine for the duration of one call.
pub struct EngineLease {
    _guard: OwnedRwLockReadGuard<Slot>,
    engine: Arc<dyn AnalysisEngine>,
    analysis_lock: Arc<Mutex<()>>,
}

impl EngineLease {
    /// Wait for the right to analyze. `None` when the engine allows
    /// concurrent analyses.
    pub async fn analysis_permit(&self) -> Option<OwnedMutexGuard<()>> {
        if self.engine.supports_concurrent_analysis() {
            None
        } else {
            Some(Arc::clone(&self.analysis_lock).lock_owned().await)
        }
    }
}

impl Deref for EngineLease {
    type Target = dyn AnalysisEngine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl EngineController {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
            factory,
            analysis_lock: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the engine with one built from `config`.
    ///
    /// The previous engine is stopped first; a failed stop is logged and
    /// ignored. If construction fails no engine is left installed.
    pub async fn register(&self, config: GlobalConfiguration) -> Result<()> {
        let storage_id = config.server_id.clone();
        let mut slot = self.slot.write().await;
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }

        if let Some(previous) = slot.take() {
            info!("Stopping previous engine");
            if let Err(e) = previous.stop(false).await {
                warn!("Failed to stop previous engine: {}", e);
            }
        }

        match self.factory.create(config).await {
            Ok(engine) => {
                *slot = Some(engine);
                info!("Engine registered for storage '{}'", storage_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start engine for storage '{}': {}", storage_id, e);
                Err(Error::Registration {
                    storage_id,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Lease the current engine, waiting for any registration in progress.
    pub async fn acquire(&self) -> Result<EngineLease> {
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }

        let guard = Arc::clone(&self.slot).read_owned().await;
        let engine = guard.as_ref().cloned().ok_or(Error::NotRegistered)?;

        Ok(EngineLease {
            _guard: guard,
            engine,
            analysis_lock: Arc::clone(&self.analysis_lock),
        })
    }

    /// Current engine without waiting; `None` while unregistered or while a
    /// registration holds the slot.
    pub fn current(&self) -> Option<Arc<dyn AnalysisEngine>> {
        self.slot.try_read().ok().and_then(|slot| slot.clone())
    }

    pub fn is_registered(&self) -> bool {
        self.current().is_some()
    }

    /// State reported by the engine.
    pub async fn status(&self) -> Result<StorageState> {
        let engine = self.acquire().await?;
        Ok(engine.state().await)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse new calls, wait for in-flight ones, then stop the engine.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut slot = self.slot.write().await;
        if let Some(engine) = slot.take() {
            info!("Stopping engine");
            if let Err(e) = engine.stop(false).await {
                warn!("Failed to stop engine: {}", e);
            }
        }
    }
}
