//! # Storage Values
//!
//! The sum type every backend stores, its serialization boundary, and the
//! content-hash tokens used for CAS.
//!
//! Backends never inspect values beyond this module: the codec is a pure
//! `encode`/`decode` pair, and a value's CAS token is the SHA-256 of its
//! encoded form, so the token changes exactly when the stored bytes change.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// A value as stored by any cache backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StorageValue {
    Bytes(Vec<u8>),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl StorageValue {
    /// Numeric view for increment/decrement. Integers pass through; text
    /// that parses as an integer counts as numeric, everything else doesn't.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StorageValue::Int(i) => Some(*i),
            StorageValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for StorageValue {
    fn from(s: &str) -> Self {
        StorageValue::Text(s.to_string())
    }
}

impl From<String> for StorageValue {
    fn from(s: String) -> Self {
        StorageValue::Text(s)
    }
}

impl From<i64> for StorageValue {
    fn from(i: i64) -> Self {
        StorageValue::Int(i)
    }
}

impl From<f64> for StorageValue {
    fn from(f: f64) -> Self {
        StorageValue::Float(f)
    }
}

impl From<Vec<u8>> for StorageValue {
    fn from(b: Vec<u8>) -> Self {
        StorageValue::Bytes(b)
    }
}

impl From<serde_json::Value> for StorageValue {
    fn from(v: serde_json::Value) -> Self {
        StorageValue::Json(v)
    }
}

/// Serialize a value for storage.
pub fn encode(value: &StorageValue) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize a stored value.
pub fn decode(encoded: &str) -> Result<StorageValue> {
    Ok(serde_json::from_str(encoded)?)
}

/// CAS token for an already-encoded value: lowercase hex SHA-256.
pub fn token_for_encoded(encoded: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hex::encode(hasher.finalize())
}

/// CAS token for a value.
pub fn token_for(value: &StorageValue) -> Result<String> {
    Ok(token_for_encoded(&encode(value)?))
}

/// The record envelope persisted by blob-style backends:
/// value, logical expiry (unix seconds, 0 = never) and the time the value
/// took to compute (microseconds), which drives early expiration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub v: StorageValue,
    pub e: i64,
    pub ct: Option<u64>,
}

impl Record {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Record> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_changes_with_value() {
        let a = token_for(&StorageValue::from("hello")).unwrap();
        let b = token_for(&StorageValue::from("world")).unwrap();
        let a2 = token_for(&StorageValue::from("hello")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_token_distinguishes_types() {
        // "5" as text and 5 as int are different stored values
        let text = token_for(&StorageValue::from("5")).unwrap();
        let int = token_for(&StorageValue::from(5i64)).unwrap();
        assert_ne!(text, int);
    }

    #[test]
    fn test_codec_round_trip() {
        let value = StorageValue::Json(serde_json::json!({"a": [1, 2, 3]}));
        let encoded = encode(&value).unwrap();
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_as_int() {
        assert_eq!(StorageValue::from(42i64).as_int(), Some(42));
        assert_eq!(StorageValue::from("42").as_int(), Some(42));
        assert_eq!(StorageValue::from("forty-two").as_int(), None);
        assert_eq!(StorageValue::from(vec![1u8]).as_int(), None);
    }

    #[test]
    fn test_record_envelope_fields() {
        let record = Record {
            v: StorageValue::from("x"),
            e: 0,
            ct: Some(1500),
        };
        let raw = record.encode().unwrap();
        // field names are part of the on-disk format
        assert!(raw.contains("\"v\""));
        assert!(raw.contains("\"e\""));
        assert!(raw.contains("\"ct\""));
        let back = Record::decode(&raw).unwrap();
        assert_eq!(back.e, 0);
        assert_eq!(back.ct, Some(1500));
    }
}
