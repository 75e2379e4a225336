use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical params JSON, a zero separator, then the payload.
///
/// serde_json keeps object keys sorted (no `preserve_order`), so equal params
/// always serialize to equal bytes.
pub fn fingerprint(params: &Value, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_input_same_fingerprint() {
        let a = fingerprint(&json!({"b": 1, "a": 2}), b"deck");
        let b = fingerprint(&json!({"a": 2, "b": 1}), b"deck");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_is_lowercase_hex() {
        let fp = fingerprint(&json!({"target_count": 2}), b"PK");
        assert!(fp
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(hex::decode(&fp).unwrap().len(), 32);
    }

    #[test]
    fn params_and_payload_both_matter() {
        let base = fingerprint(&json!({}), b"deck");
        assert_ne!(base, fingerprint(&json!({}), b"deck2"));
        assert_ne!(base, fingerprint(&json!({"target_count": 3}), b"deck"));
    }
}
