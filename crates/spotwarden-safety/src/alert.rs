//! Operator alerts.

use std::fmt;
use std::sync::Mutex;

use tracing::error;

use spotwarden_core::WorkloadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    BreakerOpened,
    ManualReview,
    /// A termination notice ended on the degraded path.
    FailoverDegraded,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BreakerOpened => "breaker-opened",
            Self::ManualReview => "manual-review",
            Self::FailoverDegraded => "failover-degraded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub workload_id: WorkloadId,
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: u64,
}

/// Destination for operator alerts (pager, chat, email...).
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Logs alerts at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        error!(
            workload = %alert.workload_id,
            kind = %alert.kind,
            raised_at = alert.raised_at,
            "operator alert: {}",
            alert.message
        );
    }
}

/// Keeps alerts in memory; used by tests and the simulated daemon.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}
