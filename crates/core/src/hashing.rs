//! Content hashing and token estimation helpers

use sha2::{Digest, Sha256};

/// Separator between hashed parts so `["ab", "c"]` and `["a", "bc"]` differ
const PART_SEPARATOR: u8 = 0x1f;

/// Per-message overhead added by [`estimate_message_tokens`]
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Hex-encoded SHA-256 of a single text
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Hex-encoded SHA-256 over several parts
pub fn hash_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update([PART_SEPARATOR]);
        }
        hasher.update(part.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Rough token estimate: four characters per token, never zero
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

/// Token estimate for one chat message including role and framing overhead
pub fn estimate_message_tokens(role: &str, content: &str) -> u64 {
    estimate_tokens(content) + estimate_tokens(role) + MESSAGE_OVERHEAD_TOKENS
}
