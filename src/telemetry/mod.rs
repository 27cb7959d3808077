//! Decision telemetry and suspicious-pattern alerting.
//!
//! Everything in this module is fire-and-forget: recording a decision can
//! never block or fail the request path, and alert evaluation is a pure
//! function of recent per-origin counts against configured thresholds.

mod alert;
mod monitor;

pub use alert::{Alert, AlertKind, AlertSeverity, AlertSink, LogAlertSink};
pub use monitor::{DecisionMonitor, MonitorConfig, SecurityEventKind};
