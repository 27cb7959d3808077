//! Storage key derivation.

use super::descriptor::RequestDescriptor;
use super::rules::{PartitionType, RateLimitRule};

/// Sentinel partition value for global rules.
const GLOBAL_VALUE: &str = "global";

/// Derive the storage key for a descriptor under a rule.
///
/// The key is `{partitionType}:{partitionValue}:{ruleId}`; the counter
/// store appends its own window bucket suffix. Deterministic: the same
/// descriptor and rule always yield the same key, and distinct rules can
/// never collide because the rule id is part of the key.
///
/// Returns `None` when the descriptor lacks the field the rule's partition
/// type needs (for example a client rule on an anonymous request). Such
/// rules are filtered out by the rule provider, so a `None` here means
/// "skip", not a failure.
pub fn derive_key(descriptor: &RequestDescriptor, rule: &RateLimitRule) -> Option<String> {
    let value = match rule.partition {
        PartitionType::IpAddress => descriptor.ip.to_string(),
        PartitionType::Client => descriptor
            .client_id
            .as_deref()
            .filter(|id| !id.is_empty())?
            .to_string(),
        PartitionType::Organization => descriptor
            .organization_id
            .as_deref()
            .filter(|id| !id.is_empty())?
            .to_string(),
        PartitionType::Endpoint => rule
            .endpoint_pattern
            .as_deref()
            .filter(|p| !p.is_empty())?
            .to_ascii_lowercase(),
        PartitionType::Global => GLOBAL_VALUE.to_string(),
    };

    Some(format!("{}:{}:{}", rule.partition.as_str(), value, rule.id))
}
