//! Rate limiting decision engine and its supporting types.

mod descriptor;
mod engine;
mod key;
mod provider;
mod rules;

pub use descriptor::RequestDescriptor;
pub use engine::{Decision, FailurePolicy, RateLimiter, RuleStatus};
pub use key::derive_key;
pub use provider::{FileRuleProvider, RuleProvider, StaticRuleProvider};
pub use rules::{PartitionType, RateLimitRule, RuleSet};
