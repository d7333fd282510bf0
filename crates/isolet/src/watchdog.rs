//! Liveness and resource-ceiling enforcement for one worker.
//!
//! The watchdog consumes alive reports forwarded by the controller's reader task. It never
//! touches the process itself: a [`Verdict::Violation`] is handed back to the controller,
//! which latches the reason and kills the worker.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::protocol::AliveReport;
use crate::config::{CpuLimits, MemoryLimits, WorkerConfig};
use crate::health::{ExitLatch, ExitReason};

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub key: String,
    pub period: Duration,
    /// Slack added to `period` for each report deadline.
    pub timeout: Duration,
    pub max_cpu_usage: Option<CpuLimits>,
    pub max_memory_usage: Option<MemoryLimits>,
}

impl WatchdogConfig {
    pub fn from_worker(config: &WorkerConfig, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            period: config.check_alive_period,
            timeout: config.check_alive_timeout,
            max_cpu_usage: config.max_cpu_usage,
            max_memory_usage: config.max_memory_usage.clone(),
        }
    }

    fn deadline(&self) -> Duration {
        self.period + self.timeout
    }
}

/// How a watchdog loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The worker was already gone; nothing to enforce.
    Exited,
    /// The worker must be killed for this reason.
    Violation(ExitReason),
}

/// First rule `report` breaks, if any.
pub fn check_report(config: &WatchdogConfig, report: &AliveReport) -> Option<ExitReason> {
    if report.key != config.key {
        return Some(ExitReason::key_mismatch(report.key.clone()));
    }
    if let Some(limits) = &config.max_cpu_usage {
        let cpu = &report.cpu_usage;
        for (metric, observed, limit) in [
            ("cpuUsage.user", cpu.user, limits.user),
            ("cpuUsage.system", cpu.system, limits.system),
        ] {
            if let Some(limit) = limit
                && observed > limit
            {
                return Some(ExitReason::resource(metric, observed, limit));
            }
        }
    }
    if let Some(limits) = &config.max_memory_usage {
        for (metric, limit) in limits.iter() {
            if let Some(observed) = report.memory_usage.get(metric)
                && observed > limit
            {
                return Some(ExitReason::resource(
                    format!("memoryUsage.{metric}"),
                    observed,
                    limit,
                ));
            }
        }
    }
    None
}

/// Runs until the worker exits or breaks a rule.
pub async fn run_watchdog(
    config: WatchdogConfig,
    mut reports: mpsc::UnboundedReceiver<AliveReport>,
    exit: ExitLatch,
) -> Verdict {
    let deadline = config.deadline();
    loop {
        if exit.is_set() {
            return Verdict::Exited;
        }
        let report = tokio::select! {
            biased;

            _ = exit.wait() => return Verdict::Exited,
            report = tokio::time::timeout(deadline, reports.recv()) => report,
        };
        match report {
            Err(_) => {
                tracing::warn!(
                    target: "isolet::watchdog",
                    waited_ms = deadline.as_millis() as u64,
                    "No alive report in time"
                );
                return Verdict::Violation(ExitReason::timeout(deadline.as_millis() as u64));
            }
            // Reader is gone, so the process is on its way out.
            Ok(None) => return Verdict::Exited,
            Ok(Some(report)) => {
                tracing::trace!(
                    target: "isolet::watchdog",
                    cpu_user = report.cpu_usage.user,
                    cpu_system = report.cpu_usage.system,
                    rss = report.memory_usage.rss,
                    "Alive report"
                );
                if let Some(reason) = check_report(&config, &report) {
                    tracing::warn!(
                        target: "isolet::watchdog",
                        reason = %reason.reason,
                        "Worker broke a health rule"
                    );
                    return Verdict::Violation(reason);
                }
            }
        }
    }
}
