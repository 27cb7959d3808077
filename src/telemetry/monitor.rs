//! Rolling per-origin counters and alert generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::trace;

use super::alert::{severity_for, Alert, AlertKind, AlertSeverity, AlertSink, LogAlertSink};
use crate::limiter::{Decision, RequestDescriptor};
use crate::store::{sliding_count, Clock, SystemClock};

/// Security event categories fed in by the caller alongside rate limit
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityEventKind {
    /// A failed login or credential check.
    AuthenticationFailure,
    /// A request carrying an unknown or revoked API key.
    InvalidApiKey,
}

impl SecurityEventKind {
    fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::AuthenticationFailure => "auth_failure",
            SecurityEventKind::InvalidApiKey => "invalid_api_key",
        }
    }
}

/// Thresholds for alert generation.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Denials per origin within the window before an alert is raised.
    pub denial_threshold: u64,
    /// Security events per origin within the window before an alert is raised.
    pub auth_failure_threshold: u64,
    /// Length of the rolling window.
    pub window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            denial_threshold: 20,
            auth_failure_threshold: 10,
            window: Duration::from_secs(300),
        }
    }
}

/// Two adjacent window buckets plus the highest severity already emitted
/// for the current bucket, so an origin alerts once per escalation rather
/// than once per event.
#[derive(Debug, Clone, Copy)]
struct OriginWindow {
    bucket: u64,
    current: u64,
    previous: u64,
    last_emitted: Option<AlertSeverity>,
}

/// Records decisions and security events and raises alerts when an origin
/// crosses a threshold within the rolling window.
///
/// All operations are synchronous map updates; nothing here can block or
/// fail the request path, and nothing here influences decisions.
pub struct DecisionMonitor {
    config: MonitorConfig,
    sink: Arc<dyn AlertSink>,
    denials: DashMap<String, OriginWindow>,
    security_events: DashMap<String, OriginWindow>,
    degraded_checks: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl DecisionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_sink(config, Arc::new(LogAlertSink))
    }

    pub fn with_sink(config: MonitorConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            sink,
            denials: DashMap::new(),
            security_events: DashMap::new(),
            degraded_checks: AtomicU64::new(0),
            clock: Arc::new(SystemClock),
        }
    }

    #[cfg(test)]
    fn with_sink_and_clock(
        config: MonitorConfig,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            sink,
            denials: DashMap::new(),
            security_events: DashMap::new(),
            degraded_checks: AtomicU64::new(0),
            clock,
        }
    }

    /// Record the outcome of one rate limit check.
    pub fn record_decision(&self, decision: &Decision, descriptor: &RequestDescriptor) {
        trace!(allowed = decision.allowed, origin = %descriptor.origin(), "Recording decision");
        if !decision.allowed {
            self.bump(
                &self.denials,
                descriptor.origin(),
                self.config.denial_threshold,
                AlertKind::ExcessiveDenials,
            );
        }
    }

    /// Record a caller-observed security event for an origin.
    pub fn record_security_event(&self, kind: SecurityEventKind, origin: &str) {
        self.bump(
            &self.security_events,
            format!("{}:{}", kind.as_str(), origin),
            self.config.auth_failure_threshold,
            AlertKind::BruteForce,
        );
    }

    /// Count a check that degraded because the counter store was unreachable.
    pub fn record_degraded(&self) {
        self.degraded_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of degraded checks since startup.
    pub fn degraded_count(&self) -> u64 {
        self.degraded_checks.load(Ordering::Relaxed)
    }

    /// Current rolling denial count for an origin.
    pub fn denial_count(&self, origin: &str) -> u64 {
        let window_ms = self.window_millis();
        let now = self.clock.now_millis();
        let bucket = now / window_ms;
        let elapsed = Duration::from_millis(now % window_ms);

        let Some(entry) = self.denials.get(origin) else {
            return 0;
        };
        let (current, previous) = if entry.bucket == bucket {
            (entry.current, entry.previous)
        } else if entry.bucket + 1 == bucket {
            (0, entry.current)
        } else {
            (0, 0)
        };
        sliding_count(current, previous, elapsed, self.config.window)
    }

    fn window_millis(&self) -> u64 {
        (self.config.window.as_millis() as u64).max(1)
    }

    fn bump(
        &self,
        map: &DashMap<String, OriginWindow>,
        origin: String,
        threshold: u64,
        kind: AlertKind,
    ) {
        let window_ms = self.window_millis();
        let now = self.clock.now_millis();
        let bucket = now / window_ms;
        let elapsed = Duration::from_millis(now % window_ms);

        let mut entry = map.entry(origin.clone()).or_insert(OriginWindow {
            bucket,
            current: 0,
            previous: 0,
            last_emitted: None,
        });

        if entry.bucket != bucket {
            entry.previous = if entry.bucket + 1 == bucket {
                entry.current
            } else {
                0
            };
            entry.current = 0;
            entry.bucket = bucket;
            entry.last_emitted = None;
        }
        entry.current += 1;

        let count = sliding_count(entry.current, entry.previous, elapsed, self.config.window);
        if let Some(severity) = severity_for(count, threshold) {
            let escalated = entry.last_emitted.map_or(true, |prev| severity > prev);
            if escalated {
                entry.last_emitted = Some(severity);
                let alert =
                    Alert::new(kind, severity, &origin, count, threshold, self.config.window);
                self.sink.emit(&alert);
            }
        }
    }
}
