//! Rule providers: sources of the ordered rule list for a request.
//!
//! A provider only filters and orders; no counting happens here. The
//! returned rules are enabled, applicable to the descriptor, and sorted by
//! descending priority so stricter rules are evaluated first.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use super::descriptor::RequestDescriptor;
use super::rules::{RateLimitRule, RuleSet};
use crate::error::Result;

/// Trait for components that supply the rules applicable to a request.
#[async_trait]
pub trait RuleProvider: Send + Sync {
    /// The enabled rules applicable to `descriptor`, ordered by descending
    /// priority.
    async fn applicable_rules(&self, descriptor: &RequestDescriptor) -> Vec<RateLimitRule>;
}

fn filter_applicable(rules: &[RateLimitRule], descriptor: &RequestDescriptor) -> Vec<RateLimitRule> {
    rules
        .iter()
        .filter(|rule| rule.applies_to(descriptor))
        .cloned()
        .collect()
}

/// An in-memory rule provider with a hot-swappable rule list.
pub struct StaticRuleProvider {
    rules: RwLock<Vec<RateLimitRule>>,
}

impl StaticRuleProvider {
    /// Create a provider from a rule list. Malformed rules are dropped with
    /// a warning; the rest are sorted by descending priority.
    pub fn new(rules: Vec<RateLimitRule>) -> Self {
        Self {
            rules: RwLock::new(RuleSet { rules }.into_valid_rules()),
        }
    }

    /// Replace the rule list. Takes effect for the next check.
    pub fn set_rules(&self, rules: Vec<RateLimitRule>) {
        *self.rules.write() = RuleSet { rules }.into_valid_rules();
    }

    /// Number of valid rules currently held.
    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }
}

#[async_trait]
impl RuleProvider for StaticRuleProvider {
    async fn applicable_rules(&self, descriptor: &RequestDescriptor) -> Vec<RateLimitRule> {
        filter_applicable(&self.rules.read(), descriptor)
    }
}

struct CachedRules {
    rules: Vec<RateLimitRule>,
    expires_at: Instant,
}

/// A rule provider backed by a YAML/JSON file, re-read on a short-lived
/// cache so rule edits take effect without a restart.
///
/// The reload interval is jittered by up to 10% so a fleet of instances
/// does not hit the file (or the filesystem behind it) in lockstep. If a
/// reload fails the previous rules stay in effect.
pub struct FileRuleProvider {
    path: PathBuf,
    reload_interval: Duration,
    cache: RwLock<CachedRules>,
}

impl FileRuleProvider {
    /// Load the file eagerly and create the provider. Errors if the initial
    /// load fails, so a bad path is caught at startup.
    pub fn load(path: impl Into<PathBuf>, reload_interval: Duration) -> Result<Self> {
        let path = path.into();
        let rules = RuleSet::from_file(&path)?.into_valid_rules();
        let expires_at = Instant::now() + jittered(reload_interval);

        Ok(Self {
            path,
            reload_interval,
            cache: RwLock::new(CachedRules { rules, expires_at }),
        })
    }

    async fn refresh_if_stale(&self) {
        if self.cache.read().expires_at > Instant::now() {
            return;
        }

        let reloaded = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(Into::into)
            .and_then(|contents| {
                match self.path.extension().and_then(|e| e.to_str()) {
                    Some("json") => RuleSet::from_json(&contents),
                    _ => RuleSet::from_yaml(&contents),
                }
            });

        let mut cache = self.cache.write();
        cache.expires_at = Instant::now() + jittered(self.reload_interval);
        match reloaded {
            Ok(set) => {
                cache.rules = set.into_valid_rules();
                debug!(path = %self.path.display(), rules = cache.rules.len(), "Reloaded rate limit rules");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Rule reload failed; keeping previous rules");
            }
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    interval + interval.mul_f64(rand::thread_rng().gen_range(0.0..0.1))
}

#[async_trait]
impl RuleProvider for FileRuleProvider {
    async fn applicable_rules(&self, descriptor: &RequestDescriptor) -> Vec<RateLimitRule> {
        self.refresh_if_stale().await;
        filter_applicable(&self.cache.read().rules, descriptor)
    }
}
