//! Per-call forwarding of analysis issues.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::daemon::translate;
use crate::engine::{Issue, IssueListener};
use crate::metrics::Metrics;
use crate::rpc::protocol as wire;

/// Issue listener feeding one `analyze` call's outbound stream.
///
/// The engine is suspended on each issue until the stream accepts it. Once
/// the receiving side is gone, remaining issues are discarded.
pub struct DiagnosticRelay {
    sender: mpsc::Sender<wire::Issue>,
    closed: AtomicBool,
    forwarded: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl DiagnosticRelay {
    pub fn new(sender: mpsc::Sender<wire::Issue>, metrics: Arc<Metrics>) -> Self {
        Self {
            sender,
            closed: AtomicBool::new(false),
            forwarded: AtomicUsize::new(0),
            metrics,
        }
    }

    /// Issues accepted by the stream so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Whether the stream went away before the analysis ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IssueListener for DiagnosticRelay {
    async fn on_issue(&self, issue: Issue) {
        if self.is_closed() {
            return;
        }

        if self.sender.send(translate::issue(issue)).await.is_err() {
            debug!("Issue stream closed, discarding remaining issues");
            self.closed.store(true, Ordering::Relaxed);
            return;
        }

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_issues();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn issue(rule_key: &str) -> Issue {
        Issue {
            severity: "MAJOR".to_string(),
            rule_key: rule_key.to_string(),
            rule_name: "Rule".to_string(),
            message: "message".to_string(),
            start_line: Some(1),
            start_line_offset: None,
            end_line: None,
            end_line_offset: None,
            input_file: None,
        }
    }

    #[tokio::test]
    async fn test_forwards_in_order() {
        let (tx, mut rx) = mpsc::channel(1);
        let relay = Arc::new(DiagnosticRelay::new(tx, Metrics::new()));

        let producer = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move {
                for key in ["a", "b", "c"] {
                    relay.on_issue(issue(key)).await;
                }
            })
        };

        let mut keys = Vec::new();
        for _ in 0..3 {
            keys.push(rx.recv().await.unwrap().rule_key);
        }
        producer.await.unwrap();

        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(relay.forwarded(), 3);
    }

    #[tokio::test]
    async fn test_slow_consumer_suspends_producer() {
        let (tx, mut rx) = mpsc::channel(1);
        let relay = Arc::new(DiagnosticRelay::new(tx, Metrics::new()));

        let producer = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move {
                relay.on_issue(issue("a")).await;
                relay.on_issue(issue("b")).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(relay.forwarded(), 1);

        assert_eq!(rx.recv().await.unwrap().rule_key, "a");
        assert_eq!(rx.recv().await.unwrap().rule_key, "b");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_discards_without_error() {
        let (tx, rx) = mpsc::channel(1);
        let metrics = Metrics::new();
        let relay = DiagnosticRelay::new(tx, Arc::clone(&metrics));
        drop(rx);

        relay.on_issue(issue("a")).await;
        relay.on_issue(issue("b")).await;

        assert!(relay.is_closed());
        assert_eq!(relay.forwarded(), 0);
        assert_eq!(metrics.snapshot().issues_streamed, 0);
    }
}
