//! # Payload Keys
//!
//! A key is an ordered sequence of JSON values. Its canonical hash is the
//! compact JSON rendering of that sequence with every object's fields sorted,
//! so two structurally equal keys hash identically regardless of how their
//! objects were built, and reordering the sequence changes the hash.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use super::errors::{PayloadError, PayloadResult};

/// Ordered key identifying one payload entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadKey(Vec<Value>);

/// Build a [`PayloadKey`] from a list of JSON-compatible literals.
///
/// ```
/// use payload_core::payload_key;
/// let key = payload_key!["balance", "addr1", 3];
/// assert_eq!(key.hash(), r#"["balance","addr1",3]"#);
/// ```
#[macro_export]
macro_rules! payload_key {
    ($($part:tt),* $(,)?) => {
        $crate::PayloadKey::from(vec![$($crate::__private::json!($part)),*])
    };
}

impl PayloadKey {
    /// Create an empty key. Observers reject empty keys at construction.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a serializable part.
    pub fn try_with<V: Serialize>(mut self, part: V) -> PayloadResult<Self> {
        let value = serde_json::to_value(part)
            .map_err(|e| PayloadError::configuration(format!("unserializable key part: {e}")))?;
        self.0.push(value);
        Ok(self)
    }

    /// Append a string part.
    pub fn with(mut self, part: impl Into<String>) -> Self {
        self.0.push(Value::String(part.into()));
        self
    }

    /// Key parts in order.
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the key has no parts.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical, deterministic, order-sensitive hash string.
    pub fn hash(&self) -> String {
        let canonical = Value::Array(self.0.iter().map(canonicalize).collect());
        canonical.to_string()
    }

    /// Short sha256 fingerprint of the canonical hash, for log fields.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.hash().as_bytes());
        hex::encode(&digest[..8])
    }

    /// True if `prefix` matches the leading parts of this key.
    pub fn starts_with(&self, prefix: &PayloadKey) -> bool {
        prefix.0.len() <= self.0.len()
            && prefix
                .0
                .iter()
                .zip(self.0.iter())
                .all(|(a, b)| canonicalize(a) == canonicalize(b))
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(fields) => {
            let mut sorted: Vec<(&String, &Value)> = fields.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut map = Map::new();
            for (k, v) in sorted {
                map.insert(k.clone(), canonicalize(v));
            }
            Value::Object(map)
        }
        other => other.clone(),
    }
}

impl From<Vec<Value>> for PayloadKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

impl From<&str> for PayloadKey {
    fn from(part: &str) -> Self {
        Self(vec![Value::String(part.to_string())])
    }
}

impl fmt::Display for PayloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_compact_json() {
        let key = payload_key!["balance", "addr1"];
        assert_eq!(key.hash(), r#"["balance","addr1"]"#);
    }

    #[test]
    fn test_hash_ignores_object_field_order() {
        let a = PayloadKey::from(vec![json!("tx"), json!({"a": 1, "b": {"y": 2, "x": 1}})]);
        let b = PayloadKey::from(vec![json!("tx"), json!({"b": {"x": 1, "y": 2}, "a": 1})]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_is_order_sensitive() {
        let a = payload_key!["a", "b"];
        let b = payload_key!["b", "a"];
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_type_distinguishes_hash() {
        let a = payload_key!["1"];
        let b = payload_key![1];
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_starts_with() {
        let key = payload_key!["balance", "addr1", 7];
        assert!(key.starts_with(&payload_key!["balance"]));
        assert!(key.starts_with(&payload_key!["balance", "addr1"]));
        assert!(key.starts_with(&PayloadKey::new()));
        assert!(!key.starts_with(&payload_key!["balance", "addr2"]));
        assert!(!payload_key!["balance"].starts_with(&key));
    }

    #[test]
    fn test_builder() {
        let key = PayloadKey::new()
            .with("payload")
            .try_with(42u64)
            .unwrap();
        assert_eq!(key.len(), 2);
        assert_eq!(key.hash(), r#"["payload",42]"#);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = payload_key!["balance", "addr1"];
        assert_eq!(key.fingerprint(), key.clone().fingerprint());
        assert_eq!(key.fingerprint().len(), 16);
    }

    proptest! {
        #[test]
        fn prop_equal_parts_hash_equal(parts in proptest::collection::vec("[a-z0-9]{0,8}", 0..6)) {
            let a = PayloadKey::from(parts.iter().map(|p| json!(p)).collect::<Vec<_>>());
            let b = PayloadKey::from(parts.iter().map(|p| json!(p)).collect::<Vec<_>>());
            prop_assert_eq!(a.hash(), b.hash());
        }

        #[test]
        fn prop_swapping_distinct_parts_changes_hash(x in "[a-z]{1,6}", y in "[0-9]{1,6}") {
            let a = PayloadKey::from(vec![json!(x.clone()), json!(y.clone())]);
            let b = PayloadKey::from(vec![json!(y), json!(x)]);
            prop_assert_ne!(a.hash(), b.hash());
        }
    }
}
