//! Context: a caller-supplied mapping bound to a ciphertext as AAD.
//!
//! Encoding is deterministic: keys are kept sorted lexicographically, so two
//! contexts with the same entries produce the same AAD bytes regardless of
//! insertion order. An empty context encodes to no AAD at all.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An ordered map authenticated alongside the plaintext.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Canonical AAD bytes: JSON of the sorted map, empty for an empty map.
    /// Nested objects serialize with sorted keys as well.
    pub fn to_aad(&self) -> Vec<u8> {
        if self.0.is_empty() {
            return Vec::new();
        }
        serde_json::to_vec(&self.0).unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_is_sorted() {
        let a: Context = [("z", "1"), ("a", "2")].into_iter().collect();
        let b: Context = [("a", "2"), ("z", "1")].into_iter().collect();
        assert_eq!(a.to_aad(), b.to_aad());
        assert_eq!(a.to_aad(), br#"{"a":"2","z":"1"}"#.to_vec());
    }

    #[test]
    fn empty_context_has_no_aad() {
        assert!(Context::new().to_aad().is_empty());
    }

    #[test]
    fn numeric_values_are_preserved() {
        let c: Context = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.to_aad(), br#"{"a":2,"b":1}"#.to_vec());
    }

    #[test]
    fn string_and_number_values_differ() {
        let s: Context = serde_json::from_str(r#"{"a":"2"}"#).unwrap();
        let n: Context = serde_json::from_str(r#"{"a":2}"#).unwrap();
        assert_ne!(s.to_aad(), n.to_aad());
    }
}
