//! Canonical serialization and SHA-256 hashing for ledger blocks
//!
//! A block hash covers the canonical payload followed by the previous
//! block's hash, so every block commits to its position in the chain.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Rebuild `value` with object keys in sorted order at every depth
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys
pub fn canonical_serialize(payload: &Value) -> String {
    canonicalize(payload).to_string()
}

/// Lowercase hex SHA-256 of raw bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `sha256(canonicalSerialize(payload) || previousHash)`
pub fn block_hash(payload: &Value, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_serialize(payload).as_bytes());
    hasher.update(previous_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_serialize_sorts_nested_keys() {
        let payload = json!({"b": 1, "a": {"z": true, "y": [ {"d": 1, "c": 2} ]}});
        assert_eq!(
            canonical_serialize(&payload),
            r#"{"a":{"y":[{"c":2,"d":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_block_hash_is_deterministic_and_hex() {
        let payload = json!({"action": "attendance_marked", "student_id": "S1"});
        let h1 = block_hash(&payload, "0");
        let h2 = block_hash(&payload, "0");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_block_hash_binds_previous_hash() {
        let payload = json!({"action": "attendance_marked"});
        assert_ne!(block_hash(&payload, "0"), block_hash(&payload, "abc"));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
