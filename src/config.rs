//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::limiter::FailurePolicy;

/// Main configuration for the Floodgate engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rule source configuration
    #[serde(default)]
    pub rules: RulesConfig,

    /// Alerting thresholds
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoint: `memory` for the in-process store, or a
    /// `redis://` URL for the shared store.
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,

    /// Deadline for each store call, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// Behavior when the store is unreachable.
    #[serde(default)]
    pub fail_policy: FailurePolicy,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_store_endpoint(),
            timeout_ms: default_store_timeout_ms(),
            fail_policy: FailurePolicy::default(),
        }
    }
}

fn default_store_endpoint() -> String {
    "memory".to_string()
}

fn default_store_timeout_ms() -> u64 {
    50
}

/// Rule source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Path to the rules file (YAML or JSON).
    pub path: Option<String>,

    /// Rule reload interval in seconds.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl RulesConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

fn default_reload_interval() -> u64 {
    60
}

/// Alerting thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Denials per origin within the window before an alert is raised.
    #[serde(default = "default_denial_threshold")]
    pub denial_threshold: u64,

    /// Security events per origin within the window before an alert is raised.
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: u64,

    /// Rolling alert window in seconds.
    #[serde(default = "default_alert_window")]
    pub window_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            denial_threshold: default_denial_threshold(),
            auth_failure_threshold: default_auth_failure_threshold(),
            window_secs: default_alert_window(),
        }
    }
}

fn default_denial_threshold() -> u64 {
    20
}

fn default_auth_failure_threshold() -> u64 {
    10
}

fn default_alert_window() -> u64 {
    300
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FloodgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::FloodgateError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Monitor configuration derived from the alert thresholds.
    pub fn monitor_config(&self) -> crate::telemetry::MonitorConfig {
        crate::telemetry::MonitorConfig {
            denial_threshold: self.alerts.denial_threshold,
            auth_failure_threshold: self.alerts.auth_failure_threshold,
            window: Duration::from_secs(self.alerts.window_secs),
        }
    }
}
