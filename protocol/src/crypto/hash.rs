//! # Hashing
//!
//! SHA-256 digests for protocol messages and log entries.
//!
//! Objects are hashed over their *canonical JSON*: serialize to a
//! `serde_json::Value` first (whose maps are `BTreeMap`s, so keys come out
//! sorted), then to bytes. Two gateways written against the same types will
//! therefore hash the same message to the same digest regardless of field
//! declaration order.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of `data` as a fixed-size array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Canonical JSON bytes for any serializable value (sorted object keys, no
/// insignificant whitespace).
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// Hex SHA-256 over the canonical JSON of `value`.
pub fn hash_object<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&canonical_json(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let bytes = canonical_json(&a).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn struct_field_order_does_not_change_hash() {
        #[derive(Serialize)]
        struct Ab {
            a: u32,
            b: u32,
        }
        #[derive(Serialize)]
        struct Ba {
            b: u32,
            a: u32,
        }
        assert_eq!(
            hash_object(&Ab { a: 1, b: 2 }).unwrap(),
            hash_object(&Ba { b: 2, a: 1 }).unwrap()
        );
    }
}
