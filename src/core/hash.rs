//! Payload Digests
//!
//! SHA-256 digests over the canonical JSON encoding of a value.
//! Used to detect unchanged outbound payloads and to tag logs.
//!
//! `serde_json` keeps object keys sorted, so two structurally equal values
//! always encode to the same bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Domain-separated hasher for JSON payloads.
///
/// Order of updates is significant.
pub struct PayloadHasher {
    hasher: Sha256,
}

impl PayloadHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for full state snapshots.
    pub fn for_snapshot() -> Self {
        Self::new(b"SAVE_SYNC_SNAPSHOT_V1")
    }

    /// Hasher for change-delta batches.
    pub fn for_deltas() -> Self {
        Self::new(b"SAVE_SYNC_DELTAS_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with the canonical encoding of a JSON value.
    pub fn update_value(&mut self, value: &Value) {
        // Writing into a Vec cannot fail for serde_json::Value.
        let encoded = serde_json::to_vec(value).unwrap_or_default();
        self.update_bytes(&(encoded.len() as u64).to_le_bytes());
        self.update_bytes(&encoded);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Digest of a full state snapshot.
pub fn snapshot_digest(state: &Value) -> StateHash {
    let mut hasher = PayloadHasher::for_snapshot();
    hasher.update_value(state);
    hasher.finalize()
}

/// Digest of an ordered batch of change deltas.
pub fn deltas_digest(deltas: &[Value]) -> StateHash {
    let mut hasher = PayloadHasher::for_deltas();
    for delta in deltas {
        hasher.update_value(delta);
    }
    hasher.finalize()
}

/// Short hex tag of a digest for log lines.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_ignores_key_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"b":2,"a":1}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"a":1,"b":2},"x":1}"#).unwrap();
        assert_eq!(snapshot_digest(&a), snapshot_digest(&b));
    }

    #[test]
    fn test_digest_detects_change() {
        assert_ne!(snapshot_digest(&json!({ "x": 1 })), snapshot_digest(&json!({ "x": 2 })));
    }

    #[test]
    fn test_domain_separation() {
        let value = json!({ "x": 1 });
        assert_ne!(snapshot_digest(&value), deltas_digest(std::slice::from_ref(&value)));
    }

    #[test]
    fn test_delta_order_matters() {
        let first = deltas_digest(&[json!({ "a": 1 }), json!({ "a": 2 })]);
        let second = deltas_digest(&[json!({ "a": 2 }), json!({ "a": 1 })]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_short_hex() {
        assert_eq!(short_hex(&[0xab; 32]), "abababab");
    }
}
