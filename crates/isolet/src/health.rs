//! Worker exit reasons and the latch that records the first one.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitKind {
    /// `Worker::kill` was called.
    Kill,
    /// The process exited on its own.
    Exit,
    /// No alive report arrived in time.
    Timeout,
    /// A reported metric crossed its ceiling.
    ResourceViolation,
    /// An alive report carried the wrong session key.
    KeyMismatch,
}

/// Terminal state of a worker. Set once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReason {
    pub kind: ExitKind,
    /// `kill`, `exitCode`, `timeout`, `key` or the offending metric as `<category>.<metric>`.
    pub reason: String,
    /// Observed value: exit code, metric reading, late key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// What was expected instead: the configured ceiling or deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
}

impl ExitReason {
    pub fn kill() -> Self {
        Self {
            kind: ExitKind::Kill,
            reason: "kill".to_owned(),
            value: None,
            expected: None,
        }
    }

    pub fn exited(status: ExitStatus) -> Self {
        let value = match status.code() {
            Some(code) => serde_json::Value::from(code),
            None => serde_json::Value::from(status.to_string()),
        };
        Self {
            kind: ExitKind::Exit,
            reason: "exitCode".to_owned(),
            value: Some(value),
            expected: None,
        }
    }

    /// Exit observed without a status, e.g. the control channel closed first.
    pub fn channel_closed() -> Self {
        Self {
            kind: ExitKind::Exit,
            reason: "exitCode".to_owned(),
            value: None,
            expected: None,
        }
    }

    pub fn timeout(waited_ms: u64) -> Self {
        Self {
            kind: ExitKind::Timeout,
            reason: "timeout".to_owned(),
            value: None,
            expected: Some(waited_ms.into()),
        }
    }

    pub fn key_mismatch(got: impl Into<String>) -> Self {
        Self {
            kind: ExitKind::KeyMismatch,
            reason: "key".to_owned(),
            value: Some(serde_json::Value::String(got.into())),
            expected: None,
        }
    }

    pub fn resource(metric: impl Into<String>, observed: u64, limit: u64) -> Self {
        Self {
            kind: ExitKind::ResourceViolation,
            reason: metric.into(),
            value: Some(observed.into()),
            expected: Some(limit.into()),
        }
    }

    /// True when the exit was asked for rather than suffered.
    pub fn is_expected(&self) -> bool {
        self.kind == ExitKind::Kill
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker exited: {}", self.reason)?;
        match (&self.value, &self.expected) {
            (Some(value), Some(expected)) => write!(f, " ({value}, limit {expected})"),
            (Some(value), None) => write!(f, " ({value})"),
            (None, Some(expected)) => write!(f, " (after {expected})"),
            (None, None) => Ok(()),
        }
    }
}

/// Write-once cell for the exit reason. Process exit, the watchdog and `kill` all race to
/// set it; the first writer wins.
#[derive(Clone)]
pub struct ExitLatch {
    tx: Arc<watch::Sender<Option<ExitReason>>>,
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitLatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Records `reason` unless one is already set. Returns whether this call won.
    pub fn set(&self, reason: ExitReason) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }

    pub fn get(&self) -> Option<ExitReason> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves once a reason has been recorded.
    pub async fn wait(&self) -> ExitReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            // The sender lives in `self`, so this only fails if it was dropped mid-wait.
            if rx.changed().await.is_err() {
                return ExitReason::channel_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let latch = ExitLatch::new();
        assert!(latch.set(ExitReason::timeout(1200)));
        assert!(!latch.set(ExitReason::kill()));
        assert_eq!(latch.get().unwrap().kind, ExitKind::Timeout);
    }

    #[tokio::test]
    async fn wait_sees_a_later_set() {
        let latch = ExitLatch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        latch.set(ExitReason::resource("cpuUsage.user", 900, 500));
        let reason = waiter.await.unwrap();
        assert_eq!(reason.reason, "cpuUsage.user");
    }

    #[tokio::test]
    async fn wait_after_set_returns_immediately() {
        let latch = ExitLatch::new();
        latch.set(ExitReason::kill());
        assert!(latch.wait().await.is_expected());
    }

    #[test]
    fn resource_violation_shape() {
        insta::assert_json_snapshot!(ExitReason::resource("memoryUsage.rss", 2048, 1024), @r#"
        {
          "kind": "resource-violation",
          "reason": "memoryUsage.rss",
          "value": 2048,
          "expected": 1024
        }
        "#);
    }

    #[test]
    fn display_includes_the_limit() {
        let reason = ExitReason::resource("cpuUsage.system", 7, 3);
        assert_eq!(reason.to_string(), "worker exited: cpuUsage.system (7, limit 3)");
        assert_eq!(ExitReason::kill().to_string(), "worker exited: kill");
    }
}
