//! Single-slot forwarding of engine log lines.
//!
//! The engine logs from any thread at any time. Each line goes to whichever
//! `streamLogs` caller attached last; with nobody attached it is dropped.
//! Every line is also mirrored to `tracing` under the `engine` target.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

use crate::daemon::translate;
use crate::engine::{LogLevel, LogOutput};
use crate::metrics::Metrics;
use crate::rpc::protocol::LogEvent;

/// Lines buffered per subscriber before new ones are dropped.
const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<LogEvent>,
}

/// A subscriber removed from the slot by a newer one.
///
/// Its stream ends once this value is dropped.
pub struct Displaced {
    id: u64,
    sender: mpsc::Sender<LogEvent>,
}

impl Displaced {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver a last line to the displaced stream, if it has room.
    pub fn notify(&self, event: LogEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

/// Process-wide relay with one replaceable subscriber.
pub struct LogRelay {
    slot: Mutex<Option<Subscriber>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl LogRelay {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
            metrics,
        })
    }

    /// Replace the current subscriber, returning the one displaced.
    pub fn attach(self: &Arc<Self>) -> (LogSubscription, Option<Displaced>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);

        let previous = self.slot.lock().replace(Subscriber { id, sender });
        debug!("Log subscriber {} attached", id);

        let subscription = LogSubscription {
            id,
            receiver,
            relay: Arc::clone(self),
        };
        let displaced = previous.map(|s| Displaced {
            id: s.id,
            sender: s.sender,
        });
        (subscription, displaced)
    }

    /// Clear the slot if `id` still holds it.
    pub fn detach(&self, id: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|s| s.id == id) {
            *slot = None;
            debug!("Log subscriber {} detached", id);
            true
        } else {
            false
        }
    }

    /// Id of the current subscriber.
    #[cfg(test)]
    pub fn subscriber(&self) -> Option<u64> {
        self.slot.lock().as_ref().map(|s| s.id)
    }

    /// Drop the current subscriber, ending its stream.
    pub fn close(&self) {
        if let Some(subscriber) = self.slot.lock().take() {
            debug!("Log relay closed, dropping subscriber {}", subscriber.id);
        }
    }

    /// Forward one line without blocking.
    pub fn emit(&self, message: &str, level: LogLevel) {
        mirror(message, level);

        let mut slot = self.slot.lock();
        let Some(subscriber) = slot.as_ref() else {
            self.metrics.inc_log_dropped();
            return;
        };

        let id = subscriber.id;
        match subscriber.sender.try_send(translate::log_event(message, level)) {
            Ok(()) => self.metrics.inc_log_forwarded(),
            Err(TrySendError::Full(_)) => self.metrics.inc_log_dropped(),
            Err(TrySendError::Closed(_)) => {
                trace!("Log subscriber {} is gone", id);
                *slot = None;
                self.metrics.inc_log_dropped();
            }
        }
    }
}

impl LogOutput for LogRelay {
    fn log(&self, message: &str, level: LogLevel) {
        self.emit(message, level);
    }
}

fn mirror(message: &str, level: LogLevel) {
    match level {
        LogLevel::Trace => trace!(target: "engine", "{}", message),
        LogLevel::Debug => debug!(target: "engine", "{}", message),
        LogLevel::Info => info!(target: "engine", "{}", message),
        LogLevel::Warn => warn!(target: "engine", "{}", message),
        LogLevel::Error => error!(target: "engine", "{}", message),
    }
}

/// Receiving end of one `streamLogs` call. Detaches on drop.
pub struct LogSubscription {
    id: u64,
    receiver: mpsc::Receiver<LogEvent>,
    relay: Arc<LogRelay>,
}

impl LogSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next line; `None` once displaced or the relay closed.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.receiver.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.relay.detach(self.id);
    }
}
