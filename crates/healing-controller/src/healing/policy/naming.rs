use crate::crds::{PolicyRef, TargetRef};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const ACTION_PREFIX: &str = "heal-";

pub struct ActionNaming;

impl ActionNaming {
    /// Stable hash of the deduplication key (policy, target, trigger)
    #[must_use]
    pub fn key_hash(policy: &PolicyRef, target: &TargetRef, trigger: &str) -> String {
        let mut hasher = DefaultHasher::new();
        policy.hash(&mut hasher);
        target.hash(&mut hasher);
        trigger.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..8].to_string()
    }

    /// Name of the `sequence`-th action materialized for a key.
    /// Format: heal-{policy}-{keyhash}-{sequence}
    #[must_use]
    pub fn action_name(policy_name: &str, key_hash: &str, sequence: usize) -> String {
        let suffix = format!("-{key_hash}-{sequence}");
        let available = MAX_K8S_NAME_LENGTH
            .saturating_sub(ACTION_PREFIX.len())
            .saturating_sub(suffix.len());
        let policy = Self::sanitize(policy_name, available);
        format!("{ACTION_PREFIX}{policy}{suffix}")
    }

    /// Label-safe rendering of an arbitrary name (at most 63 chars,
    /// alphanumeric at both ends)
    #[must_use]
    pub fn label_value(value: &str) -> String {
        Self::sanitize(value, MAX_K8S_NAME_LENGTH)
    }

    fn sanitize(value: &str, limit: usize) -> String {
        let cleaned: String = value
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .take(limit)
            .collect();
        let trimmed = cleaned.trim_matches('-');
        if trimmed.is_empty() {
            "policy".chars().take(limit).collect()
        } else {
            trimmed.to_string()
        }
    }
}
