//! Outbound dedup keys.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::ingress::payload::normalize_contact_id;

/// Identifies "the same message to the same recipient". The recipient is
/// normalized the same way as contact ids; send time is not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub recipient: String,
    pub fingerprint: u64,
}

impl DedupKey {
    pub fn new(recipient: &str, content: &str, max_chars: usize) -> Self {
        Self {
            recipient: normalize_contact_id(recipient)
                .unwrap_or_else(|| recipient.trim().to_string()),
            fingerprint: fingerprint(content, max_chars),
        }
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:016x}", self.recipient, self.fingerprint)
    }
}

/// Lower-case, collapse whitespace runs, truncate to `max_chars` characters.
pub fn normalize_content(content: &str, max_chars: usize) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(max_chars)
        .collect()
}

pub fn fingerprint(content: &str, max_chars: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    normalize_content(content, max_chars).hash(&mut hasher);
    hasher.finish()
}
