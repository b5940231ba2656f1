//! Structural query keys and the matchers used to select them.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// One component of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
  Str(String),
  Int(i64),
  Bool(bool),
  /// Named parameters; absent values are never stored, so `{q: None}` and
  /// `{}` produce the same key
  Map(BTreeMap<String, KeyPart>),
}

impl KeyPart {
  /// Build a map part from optional named parameters, skipping `None`s.
  pub fn map<K, I>(params: I) -> Self
  where
    K: Into<String>,
    I: IntoIterator<Item = (K, Option<KeyPart>)>,
  {
    KeyPart::Map(
      params
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.into(), v)))
        .collect(),
    )
  }

  fn to_json(&self) -> Value {
    match self {
      KeyPart::Str(s) => Value::String(s.clone()),
      KeyPart::Int(i) => Value::from(*i),
      KeyPart::Bool(b) => Value::Bool(*b),
      KeyPart::Map(m) => Value::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<i64> for KeyPart {
  fn from(i: i64) -> Self {
    KeyPart::Int(i)
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

/// Identifies a cacheable read.
///
/// Keys compare by value: two keys built independently from equal parts hit
/// the same cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  /// Start a key with its resource name (e.g. "cart", "product").
  pub fn new(resource: impl Into<String>) -> Self {
    Self(vec![KeyPart::Str(resource.into())])
  }

  /// Append a part to the key.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  /// Resource name, the first part of the key.
  pub fn resource(&self) -> Option<&str> {
    match self.0.first() {
      Some(KeyPart::Str(s)) => Some(s),
      _ => None,
    }
  }

  /// Whether `self` begins with every part of `prefix`.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.len() >= prefix.0.len() && self.0.iter().zip(&prefix.0).all(|(a, b)| a == b)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts = Value::Array(self.0.iter().map(KeyPart::to_json).collect());
    write!(f, "{}", parts)
  }
}

/// Selects a set of cache entries, for invalidation and optimistic patches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatcher {
  /// Only this exact key
  Exact(QueryKey),
  /// Every key that begins with these parts
  Prefix(QueryKey),
  /// Every key in the cache
  All,
}

impl KeyMatcher {
  pub fn matches(&self, key: &QueryKey) -> bool {
    match self {
      KeyMatcher::Exact(k) => k == key,
      KeyMatcher::Prefix(p) => key.starts_with(p),
      KeyMatcher::All => true,
    }
  }
}

impl From<QueryKey> for KeyMatcher {
  /// Bare keys match by prefix, so `["products"]` reaches every filtered list.
  fn from(key: QueryKey) -> Self {
    KeyMatcher::Prefix(key)
  }
}
