//! Alert types and sinks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// Ordered alert severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// What kind of suspicious pattern was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// An origin accumulated denials past the configured threshold.
    ExcessiveDenials,
    /// An origin accumulated authentication failures past the threshold.
    BruteForce,
}

/// A raised alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    /// The client id or IP address the pattern was observed from.
    pub origin: String,
    /// Observed count within the rolling window.
    pub count: u64,
    /// The threshold that was crossed.
    pub threshold: u64,
    /// Length of the rolling window.
    pub window_secs: u64,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub(crate) fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        origin: &str,
        count: u64,
        threshold: u64,
        window: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            kind,
            origin: origin.to_string(),
            count,
            threshold,
            window_secs: window.as_secs(),
            raised_at: Utc::now(),
        }
    }
}

/// Map a rolling count against a threshold to a severity.
///
/// Below three quarters of the threshold nothing is raised; from there
/// severity escalates with the multiple of the threshold.
pub(crate) fn severity_for(count: u64, threshold: u64) -> Option<AlertSeverity> {
    if threshold == 0 {
        return None;
    }
    if count >= threshold * 4 {
        Some(AlertSeverity::Critical)
    } else if count >= threshold * 2 {
        Some(AlertSeverity::High)
    } else if count >= threshold {
        Some(AlertSeverity::Medium)
    } else if count * 4 >= threshold * 3 {
        Some(AlertSeverity::Low)
    } else {
        None
    }
}

/// Destination for raised alerts. Implementations must not block.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// The default sink: structured warning logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, alert: &Alert) {
        warn!(
            alert_id = %alert.id,
            kind = ?alert.kind,
            severity = ?alert.severity,
            origin = %alert.origin,
            count = alert.count,
            threshold = alert.threshold,
            "Security alert raised"
        );
    }
}
