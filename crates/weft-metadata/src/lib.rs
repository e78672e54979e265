//! Weft Metadata
//!
//! An ordered multi-valued map of string keys to string values. It is the
//! context that flows through a workflow: models carry static metadata,
//! processors accumulate dynamic metadata as tasks complete, and the two are
//! combined with [`merge`].
//!
//! Each key holds an insertion-ordered set of values: adding a value that is
//! already present is a no-op, so the same (key, value) pair never appears
//! twice.
//!
//! # Example
//!
//! ```
//! use weft_metadata::{Metadata, merge};
//!
//! let mut a = Metadata::new();
//! a.add("ProductType", "L1B");
//! a.add("Filename", "granule-01.h5");
//!
//! let mut b = Metadata::new();
//! b.add("ProductType", "L1B");
//! b.add("ProductType", "L2");
//!
//! let merged = merge(&a, &b);
//! assert_eq!(merged.get_all("ProductType"), ["L1B", "L2"]);
//! assert_eq!(merged.get("Filename"), Some("granule-01.h5"));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Ordered multi-valued metadata.
///
/// Equality compares keys and the *set* of values held by each key, so two
/// contexts built from the same pairs in a different order are equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct Metadata {
  entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a value to a key. Returns `false` if the value was already present.
  pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
    let value = value.into();
    let values = self.entries.entry(key.into()).or_default();
    if values.contains(&value) {
      return false;
    }
    values.push(value);
    true
  }

  /// Add several values to a key, skipping any that are already present.
  pub fn add_all<I, S>(&mut self, key: impl Into<String>, values: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let key = key.into();
    for value in values {
      self.add(key.clone(), value);
    }
    if self.entries.get(&key).is_some_and(|v| v.is_empty()) {
      self.entries.remove(&key);
    }
  }

  /// Replace every value of a key with a single value.
  pub fn replace(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.entries.insert(key.into(), vec![value.into()]);
  }

  /// Replace every value of a key. An empty list removes the key.
  pub fn replace_all<I, S>(&mut self, key: impl Into<String>, values: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let key = key.into();
    self.entries.remove(&key);
    self.add_all(key, values);
  }

  /// Remove a key and return its values.
  pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
    self.entries.remove(key)
  }

  /// First value of a key.
  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .entries
      .get(key)
      .and_then(|values| values.first())
      .map(String::as_str)
  }

  /// All values of a key, in insertion order. Empty if the key is absent.
  pub fn get_all(&self, key: &str) -> &[String] {
    self
      .entries
      .get(key)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn contains_key(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  /// True when the key holds more than one value.
  pub fn is_multi_valued(&self, key: &str) -> bool {
    self.get_all(key).len() > 1
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
    self
      .entries
      .iter()
      .map(|(k, v)| (k.as_str(), v.as_slice()))
  }

  /// Number of keys.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Fold every pair of `other` into `self`, keeping first-seen order.
  pub fn merge_from(&mut self, other: &Metadata) {
    for (key, values) in &other.entries {
      self.add_all(key.clone(), values.iter().cloned());
    }
  }

  /// Return the merge of `self` and `other`. See [`merge`].
  pub fn merged(&self, other: &Metadata) -> Metadata {
    merge(self, other)
  }
}

/// Merge two metadata contexts.
///
/// Every key present in either input holds the union of its values, in
/// first-seen order (`a` before `b`) with exact duplicates removed. The
/// operation is commutative under [`Metadata`]'s equality and idempotent.
pub fn merge(a: &Metadata, b: &Metadata) -> Metadata {
  let mut merged = a.clone();
  merged.merge_from(b);
  merged
}

impl PartialEq for Metadata {
  fn eq(&self, other: &Self) -> bool {
    self.entries.len() == other.entries.len()
      && self.entries.iter().all(|(key, values)| {
        other.entries.get(key).is_some_and(|theirs| {
          theirs.len() == values.len() && values.iter().all(|v| theirs.contains(v))
        })
      })
  }
}

impl Eq for Metadata {}

impl From<BTreeMap<String, Vec<String>>> for Metadata {
  fn from(raw: BTreeMap<String, Vec<String>>) -> Self {
    let mut metadata = Metadata::new();
    for (key, values) in raw {
      metadata.add_all(key, values);
    }
    metadata
  }
}

impl From<Metadata> for BTreeMap<String, Vec<String>> {
  fn from(metadata: Metadata) -> Self {
    metadata.entries
  }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
  K: Into<String>,
  V: Into<String>,
{
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    let mut metadata = Metadata::new();
    metadata.extend(iter);
    metadata
  }
}

impl<K, V> Extend<(K, V)> for Metadata
where
  K: Into<String>,
  V: Into<String>,
{
  fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
    for (key, value) in iter {
      self.add(key, value);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_add_deduplicates_values() {
    let mut met = Metadata::new();
    assert!(met.add("Key", "a"));
    assert!(met.add("Key", "b"));
    assert!(!met.add("Key", "a"));

    assert_eq!(met.get_all("Key"), ["a", "b"]);
    assert_eq!(met.get("Key"), Some("a"));
    assert!(met.is_multi_valued("Key"));
  }

  #[test]
  fn test_replace_and_remove() {
    let mut met = Metadata::new();
    met.add_all("Key", ["a", "b"]);
    met.replace("Key", "c");
    assert_eq!(met.get_all("Key"), ["c"]);

    met.replace_all("Key", Vec::<String>::new());
    assert!(!met.contains_key("Key"));

    met.add("Other", "x");
    assert_eq!(met.remove("Other"), Some(vec!["x".to_string()]));
    assert!(met.is_empty());
  }

  #[test]
  fn test_missing_key() {
    let met = Metadata::new();
    assert_eq!(met.get("nope"), None);
    assert!(met.get_all("nope").is_empty());
    assert!(!met.is_multi_valued("nope"));
  }

  #[test]
  fn test_merge_keeps_first_seen_order() {
    let a: Metadata = [("K", "1"), ("K", "2")].into_iter().collect();
    let b: Metadata = [("K", "3"), ("K", "1"), ("J", "x")].into_iter().collect();

    let ab = merge(&a, &b);
    assert_eq!(ab.get_all("K"), ["1", "2", "3"]);
    assert_eq!(ab.get_all("J"), ["x"]);

    let ba = merge(&b, &a);
    assert_eq!(ba.get_all("K"), ["3", "1", "2"]);
    assert_eq!(ab, ba);
  }

  #[test]
  fn test_equality_ignores_value_order() {
    let a: Metadata = [("K", "1"), ("K", "2")].into_iter().collect();
    let b: Metadata = [("K", "2"), ("K", "1")].into_iter().collect();
    let c: Metadata = [("K", "1")].into_iter().collect();
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn test_deserialize_deduplicates() {
    let met: Metadata = serde_json::from_str(r#"{"K": ["a", "a", "b"]}"#).unwrap();
    assert_eq!(met.get_all("K"), ["a", "b"]);

    let json = serde_json::to_value(&met).unwrap();
    assert_eq!(json, serde_json::json!({"K": ["a", "b"]}));
  }
}
