//! Call metadata (request headers and trailing metadata).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String key/value pairs attached to a call.
///
/// Keys are case-insensitive and stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for the key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries
            .insert(key.into().to_ascii_lowercase(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every entry of `other` into `self`, overwriting duplicates
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in other.iter() {
            self.entries.insert(k.to_string(), v.to_string());
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Metadata::new();
        for (k, v) in iter {
            md.insert(k, v);
        }
        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_case_insensitive() {
        let mut md = Metadata::new();
        md.insert("Authorization", "Bearer abc");
        assert_eq!(md.get("authorization"), Some("Bearer abc"));
        assert!(md.contains_key("AUTHORIZATION"));
        assert_eq!(md.remove("authorization").as_deref(), Some("Bearer abc"));
        assert!(md.is_empty());
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base: Metadata = [("a", "1"), ("b", "2")].into_iter().collect();
        let extra: Metadata = [("b", "3")].into_iter().collect();
        base.merge(&extra);
        assert_eq!(base.get("b"), Some("3"));
        assert_eq!(base.len(), 2);
    }
}
