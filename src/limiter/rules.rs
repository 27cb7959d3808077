//! Rate limit rules: the configuration entities the engine evaluates.
//!
//! Rules are owned by an external configuration surface and read-only to
//! the engine. Malformed rules are rejected at load time and never applied
//! silently.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::descriptor::RequestDescriptor;
use crate::error::{FloodgateError, Result};

/// The dimension along which a quota is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionType {
    /// One counter per source IP address.
    IpAddress,
    /// One counter per authenticated API client.
    Client,
    /// One counter per organization / tenant.
    Organization,
    /// One counter per endpoint pattern, shared by all callers.
    Endpoint,
    /// A single counter shared by all traffic.
    Global,
}

impl PartitionType {
    /// Short tag used in storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionType::IpAddress => "ip",
            PartitionType::Client => "client",
            PartitionType::Organization => "org",
            PartitionType::Endpoint => "endpoint",
            PartitionType::Global => "global",
        }
    }
}

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Stable identifier, referenced by denial decisions and storage keys.
    pub id: String,
    /// Which dimension this rule partitions traffic by.
    pub partition: PartitionType,
    /// Maximum number of requests per window.
    pub limit: u64,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Path prefix this rule applies to. Required for `Endpoint` rules.
    #[serde(default)]
    pub endpoint_pattern: Option<String>,
    /// Higher priority rules are evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules are never applied.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Check the rule's structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(FloodgateError::Config("rule is missing an id".to_string()));
        }
        if self.limit == 0 {
            return Err(FloodgateError::Config(format!(
                "rule {} has a non-positive limit",
                self.id
            )));
        }
        if self.window_secs == 0 {
            return Err(FloodgateError::Config(format!(
                "rule {} has a non-positive window",
                self.id
            )));
        }
        if self.partition == PartitionType::Endpoint
            && self
                .endpoint_pattern
                .as_deref()
                .map_or(true, |p| p.is_empty())
        {
            return Err(FloodgateError::Config(format!(
                "endpoint rule {} is missing an endpoint pattern",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether this rule applies to the given request.
    ///
    /// Disabled rules never apply. Endpoint rules require the request path
    /// to start with the rule's pattern (case-insensitive); client and
    /// organization rules require the descriptor to carry the matching
    /// identifier. IP and global rules always apply.
    pub fn applies_to(&self, descriptor: &RequestDescriptor) -> bool {
        if !self.enabled {
            return false;
        }
        match self.partition {
            PartitionType::IpAddress | PartitionType::Global => true,
            PartitionType::Client => descriptor
                .client_id
                .as_deref()
                .is_some_and(|id| !id.is_empty()),
            PartitionType::Organization => descriptor
                .organization_id
                .as_deref()
                .is_some_and(|id| !id.is_empty()),
            PartitionType::Endpoint => self.endpoint_pattern.as_deref().is_some_and(|pattern| {
                descriptor
                    .path
                    .to_ascii_lowercase()
                    .starts_with(&pattern.to_ascii_lowercase())
            }),
        }
    }
}

/// A loadable collection of rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Load a rule set from a YAML or JSON file, by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rules: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rules: {}", e)))
    }

    /// Drop malformed rules, logging each rejection, and return the valid
    /// ones sorted by descending priority.
    pub fn into_valid_rules(self) -> Vec<RateLimitRule> {
        let mut rules: Vec<RateLimitRule> = self
            .rules
            .into_iter()
            .filter(|rule| match rule.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "Rejecting malformed rate limit rule");
                    false
                }
            })
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, partition: PartitionType) -> RateLimitRule {
        RateLimitRule {
            id: id.to_string(),
            partition,
            limit: 100,
            window_secs: 60,
            endpoint_pattern: None,
            priority: 0,
            enabled: true,
        }
    }

    #[test]
    fn test_parse_yaml_rules() {
        let yaml = r#"
rules:
  - id: per-ip
    partition: ip_address
    limit: 100
    window_secs: 60
  - id: login-endpoint
    partition: endpoint
    limit: 5
    window_secs: 60
    endpoint_pattern: /api/auth/login
    priority: 10
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].partition, PartitionType::IpAddress);
        assert_eq!(
            set.rules[1].endpoint_pattern.as_deref(),
            Some("/api/auth/login")
        );
        assert!(set.rules[0].enabled);
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut r = rule("r1", PartitionType::Global);
        r.limit = 0;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut r = rule("r1", PartitionType::Global);
        r.window_secs = 0;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_validate_requires_endpoint_pattern() {
        let mut r = rule("r1", PartitionType::Endpoint);
        assert!(r.validate().is_err());

        r.endpoint_pattern = Some(String::new());
        assert!(r.validate().is_err());

        r.endpoint_pattern = Some("/api".to_string());
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_into_valid_rules_filters_and_sorts() {
        let mut bad = rule("bad", PartitionType::Endpoint);
        bad.endpoint_pattern = None;

        let mut high = rule("high", PartitionType::Global);
        high.priority = 10;
        let low = rule("low", PartitionType::Global);

        let set = RuleSet {
            rules: vec![low, bad, high],
        };
        let rules = set.into_valid_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "high");
        assert_eq!(rules[1].id, "low");
    }

    #[test]
    fn test_applies_to_endpoint_prefix_case_insensitive() {
        let mut r = rule("login", PartitionType::Endpoint);
        r.endpoint_pattern = Some("/API/Auth".to_string());

        let descriptor =
            RequestDescriptor::new("10.0.0.1".parse().unwrap(), "/api/auth/login", "POST");
        assert!(r.applies_to(&descriptor));

        let other = RequestDescriptor::new("10.0.0.1".parse().unwrap(), "/api/events", "GET");
        assert!(!r.applies_to(&other));
    }

    #[test]
    fn test_applies_to_requires_identifier() {
        let client_rule = rule("per-client", PartitionType::Client);
        let org_rule = rule("per-org", PartitionType::Organization);
        let anonymous = RequestDescriptor::new("10.0.0.1".parse().unwrap(), "/", "GET");

        assert!(!client_rule.applies_to(&anonymous));
        assert!(!org_rule.applies_to(&anonymous));

        let identified = anonymous
            .with_client_id("client-a")
            .with_organization_id("org-1");
        assert!(client_rule.applies_to(&identified));
        assert!(org_rule.applies_to(&identified));
    }

    #[test]
    fn test_disabled_rule_never_applies() {
        let mut r = rule("r1", PartitionType::Global);
        r.enabled = false;
        let descriptor = RequestDescriptor::new("10.0.0.1".parse().unwrap(), "/", "GET");
        assert!(!r.applies_to(&descriptor));
    }
}
