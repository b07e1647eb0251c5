//! Prometheus metrics for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total requests processed
    pub requests_total: AtomicU64,
    /// Successful requests
    pub requests_success: AtomicU64,
    /// Failed requests
    pub requests_failed: AtomicU64,
    /// Sum of request durations
    pub request_duration_ms: AtomicU64,
    /// Successful engine registrations
    pub registrations: AtomicU64,
    /// Completed analyses
    pub analyses: AtomicU64,
    /// Issues delivered to analyze callers
    pub issues_streamed: AtomicU64,
    /// Engine log lines delivered to a subscriber
    pub log_events_forwarded: AtomicU64,
    /// Engine log lines discarded
    pub log_events_dropped: AtomicU64,
    /// Streaming calls in flight
    pub active_streams: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the duration of one request.
    pub fn observe_request(&self, timer: &Timer) {
        self.request_duration_ms
            .fetch_add(timer.elapsed_ms(), Ordering::Relaxed);
    }

    pub fn inc_registrations(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_analyses(&self) {
        self.analyses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_issues(&self) {
        self.issues_streamed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_log_forwarded(&self) {
        self.log_events_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_log_dropped(&self) {
        self.log_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Track a streaming call until the guard is dropped.
    pub fn stream_guard(self: &Arc<Self>) -> StreamGuard {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        StreamGuard {
            metrics: Arc::clone(self),
        }
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            request_duration_ms: self.request_duration_ms.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            analyses: self.analyses.load(Ordering::Relaxed),
            issues_streamed: self.issues_streamed.load(Ordering::Relaxed),
            log_events_forwarded: self.log_events_forwarded.load(Ordering::Relaxed),
            log_events_dropped: self.log_events_dropped.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP lint_daemon_requests_total Total number of requests
# TYPE lint_daemon_requests_total counter
lint_daemon_requests_total {}

# HELP lint_daemon_requests_success Successful requests
# TYPE lint_daemon_requests_success counter
lint_daemon_requests_success {}

# HELP lint_daemon_requests_failed Failed requests
# TYPE lint_daemon_requests_failed counter
lint_daemon_requests_failed {}

# HELP lint_daemon_request_duration_ms_total Time spent serving requests
# TYPE lint_daemon_request_duration_ms_total counter
lint_daemon_request_duration_ms_total {}

# HELP lint_daemon_registrations_total Engine registrations
# TYPE lint_daemon_registrations_total counter
lint_daemon_registrations_total {}

# HELP lint_daemon_analyses_total Completed analyses
# TYPE lint_daemon_analyses_total counter
lint_daemon_analyses_total {}

# HELP lint_daemon_issues_streamed_total Issues streamed to clients
# TYPE lint_daemon_issues_streamed_total counter
lint_daemon_issues_streamed_total {}

# HELP lint_daemon_log_events_forwarded_total Engine log lines forwarded
# TYPE lint_daemon_log_events_forwarded_total counter
lint_daemon_log_events_forwarded_total {}

# HELP lint_daemon_log_events_dropped_total Engine log lines dropped
# TYPE lint_daemon_log_events_dropped_total counter
lint_daemon_log_events_dropped_total {}

# HELP lint_daemon_active_streams Streaming calls in flight
# TYPE lint_daemon_active_streams gauge
lint_daemon_active_streams {}
"#,
            s.requests_total,
            s.requests_success,
            s.requests_failed,
            s.request_duration_ms,
            s.registrations,
            s.analyses,
            s.issues_streamed,
            s.log_events_forwarded,
            s.log_events_dropped,
            s.active_streams
        )
    }
}

/// Decrements the active stream gauge on drop.
#[derive(Debug)]
pub struct StreamGuard {
    metrics: Arc<Metrics>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.metrics.active_streams.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub request_duration_ms: u64,
    pub registrations: u64,
    pub analyses: u64,
    pub issues_streamed: u64,
    pub log_events_forwarded: u64,
    pub log_events_dropped: u64,
    pub active_streams: u64,
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
