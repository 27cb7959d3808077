//! Core decision engine.
//!
//! `RateLimiter::check` is the single inbound entry point: resolve the
//! applicable rules, evaluate each against the shared counter store in
//! priority order, and fold the outcomes into one allow/deny decision.
//! The engine holds no mutable quota state of its own, so any number of
//! instances sharing a store and a rule source behave as one limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, trace, warn};

use super::descriptor::RequestDescriptor;
use super::key::derive_key;
use super::provider::RuleProvider;
use super::rules::RateLimitRule;
use crate::error::Result;
use crate::store::{CounterStore, StoreError, WindowCount};
use crate::telemetry::DecisionMonitor;

/// Deadline applied to every counter store call.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the request. A store outage degrades enforcement, not
    /// availability. This is the default.
    FailOpen,
    /// Deny the request. A store outage refuses traffic.
    FailClosed,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::FailOpen
    }
}

fn serialize_opt_duration_secs<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match duration {
        Some(d) => serializer.serialize_some(&d.as_secs()),
        None => serializer.serialize_none(),
    }
}

/// The outcome of one rate limit check.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    /// Whether the request should be admitted.
    pub allowed: bool,
    /// Count observed for the governing rule, including this request.
    pub current_count: u64,
    /// Limit of the governing rule, absent when no rule was evaluated.
    pub limit: Option<u64>,
    /// Window of the governing rule.
    #[serde(serialize_with = "serialize_opt_duration_secs")]
    pub window: Option<Duration>,
    /// When the governing rule's window bucket rolls over.
    pub resets_at: Option<DateTime<Utc>>,
    /// How long the caller should wait before retrying. Denied only.
    #[serde(serialize_with = "serialize_opt_duration_secs")]
    pub retry_after: Option<Duration>,
    /// The rule that caused the denial, if any.
    pub violated_rule: Option<RateLimitRule>,
    /// Human-readable explanation of the outcome.
    pub reason: String,
}

impl Decision {
    /// No applicable rules: always allowed.
    fn unrestricted() -> Self {
        Self {
            allowed: true,
            current_count: 0,
            limit: None,
            window: None,
            resets_at: None,
            retry_after: None,
            violated_rule: None,
            reason: "no applicable rules".to_string(),
        }
    }

    /// Allowed, annotated with the evaluated rule that has the least
    /// headroom so callers can emit informational headers.
    fn allowed_within(rule: RateLimitRule, counted: WindowCount) -> Self {
        Self {
            allowed: true,
            current_count: counted.count,
            limit: Some(rule.limit),
            window: Some(rule.window()),
            resets_at: Some(counted.resets_at),
            retry_after: None,
            violated_rule: None,
            reason: format!("within limit of rule {}", rule.id),
        }
    }

    /// Denied by `rule`. Retry-after is the remaining window, clamped to
    /// the window length so it can never exceed it.
    fn denied(rule: RateLimitRule, counted: WindowCount) -> Self {
        let remaining = (counted.resets_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(rule.window());

        Self {
            allowed: false,
            current_count: counted.count,
            limit: Some(rule.limit),
            window: Some(rule.window()),
            resets_at: Some(counted.resets_at),
            retry_after: Some(remaining),
            reason: format!(
                "limit {} per {}s exceeded for rule {}",
                rule.limit, rule.window_secs, rule.id
            ),
            violated_rule: Some(rule),
        }
    }

    fn degraded_open() -> Self {
        Self {
            allowed: true,
            current_count: 0,
            limit: None,
            window: None,
            resets_at: None,
            retry_after: None,
            violated_rule: None,
            reason: "counter store unavailable; failing open".to_string(),
        }
    }

    fn degraded_closed(window: Duration) -> Self {
        Self {
            allowed: false,
            current_count: 0,
            limit: None,
            window: Some(window),
            resets_at: None,
            retry_after: Some(window),
            violated_rule: None,
            reason: "counter store unavailable; failing closed".to_string(),
        }
    }
}

/// Read-only counter status for one rule, for status queries that must
/// not consume quota.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub rule: RateLimitRule,
    pub key: String,
    pub count: u64,
    pub remaining: u64,
}

/// The rate limiting decision engine.
pub struct RateLimiter {
    provider: Arc<dyn RuleProvider>,
    store: Arc<dyn CounterStore>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    monitor: Option<Arc<DecisionMonitor>>,
}

impl RateLimiter {
    pub fn new(provider: Arc<dyn RuleProvider>, store: Arc<dyn CounterStore>) -> Self {
        Self {
            provider,
            store,
            failure_policy: FailurePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            monitor: None,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<DecisionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Decide whether to admit the request described by `descriptor`.
    ///
    /// Counting is the side effect of evaluation and is never rolled back:
    /// a denied request has still consumed quota on every rule evaluated
    /// before the violation, so retry storms cannot reset their own
    /// counters. Returns a well-formed decision under all conditions;
    /// store outages are absorbed by the configured failure policy.
    pub async fn check(&self, descriptor: &RequestDescriptor) -> Decision {
        let decision = self.evaluate(descriptor).await;
        if let Some(monitor) = &self.monitor {
            monitor.record_decision(&decision, descriptor);
        }
        decision
    }

    async fn evaluate(&self, descriptor: &RequestDescriptor) -> Decision {
        let rules = self.provider.applicable_rules(descriptor).await;
        if rules.is_empty() {
            trace!(origin = %descriptor.origin(), "No applicable rules");
            return Decision::unrestricted();
        }

        // Highest priority first: a strict endpoint rule must get the
        // chance to deny before a loose global rule reports headroom.
        let mut tightest: Option<(u64, WindowCount, RateLimitRule)> = None;

        for rule in rules {
            let Some(key) = derive_key(descriptor, &rule) else {
                continue;
            };

            trace!(key = %key, rule = %rule.id, "Evaluating rule");

            match self.increment_with_deadline(&key, rule.window()).await {
                Ok(counted) => {
                    if counted.count > rule.limit {
                        debug!(
                            key = %key,
                            rule = %rule.id,
                            count = counted.count,
                            limit = rule.limit,
                            "Rate limit exceeded"
                        );
                        return Decision::denied(rule, counted);
                    }

                    let headroom = rule.limit - counted.count;
                    if tightest.as_ref().map_or(true, |(h, _, _)| headroom < *h) {
                        tightest = Some((headroom, counted, rule));
                    }
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        error = %e,
                        policy = ?self.failure_policy,
                        "Counter store degraded"
                    );
                    if let Some(monitor) = &self.monitor {
                        monitor.record_degraded();
                    }
                    return match self.failure_policy {
                        FailurePolicy::FailOpen => Decision::degraded_open(),
                        FailurePolicy::FailClosed => Decision::degraded_closed(rule.window()),
                    };
                }
            }
        }

        match tightest {
            Some((_, counted, rule)) => Decision::allowed_within(rule, counted),
            None => Decision::unrestricted(),
        }
    }

    /// Read-only counter status for every applicable rule. Does not
    /// consume quota; the reads are issued concurrently.
    pub async fn status(&self, descriptor: &RequestDescriptor) -> Result<Vec<RuleStatus>> {
        let rules = self.provider.applicable_rules(descriptor).await;

        let reads = rules.into_iter().filter_map(|rule| {
            let key = derive_key(descriptor, &rule)?;
            let store = self.store.clone();
            let timeout = self.store_timeout;
            Some(async move {
                let count = match tokio::time::timeout(timeout, store.get(&key, rule.window())).await
                {
                    Ok(result) => result?,
                    Err(_) => return Err(StoreError::Timeout(timeout)),
                };
                Ok(RuleStatus {
                    count,
                    remaining: rule.limit.saturating_sub(count),
                    rule,
                    key,
                })
            })
        });

        let statuses = futures::future::join_all(reads)
            .await
            .into_iter()
            .collect::<std::result::Result<Vec<_>, StoreError>>()?;
        Ok(statuses)
    }

    async fn increment_with_deadline(
        &self,
        key: &str,
        window: Duration,
    ) -> std::result::Result<WindowCount, StoreError> {
        match tokio::time::timeout(self.store_timeout, self.store.increment(key, window)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::provider::StaticRuleProvider;
    use crate::limiter::rules::PartitionType;
    use crate::store::{MemoryCounterStore, MockClock};
    use crate::telemetry::{Alert, AlertSink, MonitorConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Instant;

    fn rule(id: &str, partition: PartitionType, limit: u64, priority: i32) -> RateLimitRule {
        RateLimitRule {
            id: id.to_string(),
            partition,
            limit,
            window_secs: 60,
            endpoint_pattern: None,
            priority,
            enabled: true,
        }
    }

    fn limiter_with(rules: Vec<RateLimitRule>) -> (RateLimiter, Arc<MemoryCounterStore>) {
        // A frozen clock pinned to real time keeps window buckets from
        // rolling over mid-test.
        let clock = Arc::new(MockClock::starting_at(
            Utc::now().timestamp_millis() as u64
        ));
        let store = Arc::new(MemoryCounterStore::with_clock(clock));
        let provider = Arc::new(StaticRuleProvider::new(rules));
        (RateLimiter::new(provider, store.clone()), store)
    }

    fn descriptor_from(ip: &str) -> RequestDescriptor {
        RequestDescriptor::new(ip.parse().unwrap(), "/api/events", "GET")
    }

    /// A store that is never reachable.
    struct UnavailableStore;

    #[async_trait]
    impl CounterStore for UnavailableStore {
        async fn increment(&self, _: &str, _: Duration) -> std::result::Result<WindowCount, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn get(&self, _: &str, _: Duration) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn reset(&self, _: &str) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// A store that never answers, for deadline tests.
    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn increment(&self, _: &str, _: Duration) -> std::result::Result<WindowCount, StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _: &str, _: Duration) -> std::result::Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn reset(&self, _: &str) -> std::result::Result<u64, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_limit_five_scenario() {
        // Rule {partition=IpAddress, limit=5, window=60s}, IP 192.168.1.100:
        // five allowed calls with counts 1..5, the sixth denied.
        let (limiter, _) = limiter_with(vec![rule("ip-5", PartitionType::IpAddress, 5, 0)]);
        let descriptor = descriptor_from("192.168.1.100");

        for expected in 1..=5u64 {
            let decision = limiter.check(&descriptor).await;
            assert!(decision.allowed, "call {} should be allowed", expected);
            assert_eq!(decision.current_count, expected);
            assert_eq!(decision.limit, Some(5));
        }

        let denied = limiter.check(&descriptor).await;
        assert!(!denied.allowed);
        assert_eq!(denied.current_count, 6);
        assert_eq!(denied.violated_rule.as_ref().unwrap().id, "ip-5");
        let retry_after = denied.retry_after.unwrap();
        assert!(retry_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_no_rules_always_allowed() {
        let (limiter, _) = limiter_with(Vec::new());

        let decision = limiter.check(&descriptor_from("10.0.0.1")).await;
        assert!(decision.allowed);
        assert!(decision.limit.is_none());
        assert!(decision.violated_rule.is_none());
    }

    #[tokio::test]
    async fn test_partition_isolation_across_ips() {
        let (limiter, _) = limiter_with(vec![rule("ip-2", PartitionType::IpAddress, 2, 0)]);

        let first = descriptor_from("10.0.0.1");
        let second = descriptor_from("10.0.0.2");

        limiter.check(&first).await;
        limiter.check(&first).await;
        assert!(!limiter.check(&first).await.allowed);

        // A different IP keeps its own counter.
        let decision = limiter.check(&second).await;
        assert!(decision.allowed);
        assert_eq!(decision.current_count, 1);
    }

    #[tokio::test]
    async fn test_priority_resolution_stricter_rule_wins() {
        let mut strict = rule("login-strict", PartitionType::Endpoint, 2, 10);
        strict.endpoint_pattern = Some("/api/events".to_string());
        let loose = rule("global-loose", PartitionType::Global, 1000, 0);

        let (limiter, _) = limiter_with(vec![loose, strict]);
        let descriptor = descriptor_from("10.0.0.1");

        limiter.check(&descriptor).await;
        limiter.check(&descriptor).await;

        let denied = limiter.check(&descriptor).await;
        assert!(!denied.allowed);
        assert_eq!(denied.violated_rule.as_ref().unwrap().id, "login-strict");
    }

    #[tokio::test]
    async fn test_allowed_decision_reports_tightest_rule() {
        let tight = rule("tight", PartitionType::IpAddress, 5, 0);
        let loose = rule("loose", PartitionType::Global, 1000, 5);

        let (limiter, _) = limiter_with(vec![tight, loose]);
        let decision = limiter.check(&descriptor_from("10.0.0.1")).await;

        assert!(decision.allowed);
        assert_eq!(decision.limit, Some(5));
        assert_eq!(decision.current_count, 1);
    }

    #[tokio::test]
    async fn test_denied_requests_still_consume_quota() {
        let (limiter, store) = limiter_with(vec![rule("ip-2", PartitionType::IpAddress, 2, 0)]);
        let descriptor = descriptor_from("10.0.0.1");

        for _ in 0..5 {
            limiter.check(&descriptor).await;
        }

        // All five checks counted, including the three denied ones.
        let count = store
            .get("ip:10.0.0.1:ip-2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_fail_open_is_default() {
        let provider = Arc::new(StaticRuleProvider::new(vec![rule(
            "ip-5",
            PartitionType::IpAddress,
            5,
            0,
        )]));
        let limiter = RateLimiter::new(provider, Arc::new(UnavailableStore));

        let decision = limiter.check(&descriptor_from("10.0.0.1")).await;
        assert!(decision.allowed);
        assert!(decision.reason.contains("failing open"));
    }

    #[tokio::test]
    async fn test_fail_closed_denies() {
        let provider = Arc::new(StaticRuleProvider::new(vec![rule(
            "ip-5",
            PartitionType::IpAddress,
            5,
            0,
        )]));
        let limiter = RateLimiter::new(provider, Arc::new(UnavailableStore))
            .with_failure_policy(FailurePolicy::FailClosed);

        let decision = limiter.check(&descriptor_from("10.0.0.1")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(60)));
        assert!(decision.violated_rule.is_none());
    }

    #[tokio::test]
    async fn test_hanging_store_bounded_by_deadline() {
        let provider = Arc::new(StaticRuleProvider::new(vec![rule(
            "ip-5",
            PartitionType::IpAddress,
            5,
            0,
        )]));
        let limiter = RateLimiter::new(provider, Arc::new(HangingStore))
            .with_store_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let decision = limiter.check(&descriptor_from("10.0.0.1")).await;

        assert!(decision.allowed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_at_most_limit() {
        let (limiter, _) = limiter_with(vec![rule("ip-10", PartitionType::IpAddress, 10, 0)]);
        let limiter = Arc::new(limiter);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check(&descriptor_from("10.0.0.1")).await.allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_status_does_not_consume_quota() {
        let (limiter, _) = limiter_with(vec![rule("ip-5", PartitionType::IpAddress, 5, 0)]);
        let descriptor = descriptor_from("10.0.0.1");

        limiter.check(&descriptor).await;
        limiter.check(&descriptor).await;

        for _ in 0..3 {
            let statuses = limiter.status(&descriptor).await.unwrap();
            assert_eq!(statuses.len(), 1);
            assert_eq!(statuses[0].count, 2);
            assert_eq!(statuses[0].remaining, 3);
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl AlertSink for CollectingSink {
        fn emit(&self, alert: &Alert) {
            self.alerts.lock().push(alert.clone());
        }
    }

    #[tokio::test]
    async fn test_monitor_sees_denials() {
        let sink = Arc::new(CollectingSink::default());
        let monitor = Arc::new(DecisionMonitor::with_sink(
            MonitorConfig {
                denial_threshold: 2,
                auth_failure_threshold: 10,
                window: Duration::from_secs(300),
            },
            sink.clone(),
        ));

        let clock = Arc::new(MockClock::starting_at(Utc::now().timestamp_millis() as u64));
        let store = Arc::new(MemoryCounterStore::with_clock(clock));
        let provider = Arc::new(StaticRuleProvider::new(vec![rule(
            "ip-1",
            PartitionType::IpAddress,
            1,
            0,
        )]));
        let limiter = RateLimiter::new(provider, store).with_monitor(monitor.clone());
        let descriptor = descriptor_from("10.0.0.1");

        for _ in 0..3 {
            limiter.check(&descriptor).await;
        }

        assert_eq!(monitor.denial_count("10.0.0.1"), 2);
        assert!(!sink.alerts.lock().is_empty());
    }
}
