//! Cache entries and the partial updates applied to them.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::key::QueryKey;
use crate::error::QueryError;

/// Lifecycle state of a cached query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
  /// Entry exists but nothing has been fetched yet
  #[default]
  Idle,
  /// A fetch is outstanding; `data` may still hold the previous value
  Loading,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed; `data` keeps the last good value
  Error,
}

/// The cached state of one query key.
///
/// Cloning is cheap: the payload is shared behind an `Arc`, and a clone is
/// what subscribers receive as a snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: QueryKey,
  pub data: Option<Arc<Value>>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  pub fetched_at: Option<Instant>,
  /// Set by invalidation; cleared by the next successful fetch
  pub invalidated: bool,
  /// Bumped on every effective change, used to order and dedupe notifications
  pub version: u64,
}

impl CacheEntry {
  pub fn new(key: QueryKey) -> Self {
    Self {
      key,
      data: None,
      status: QueryStatus::Idle,
      error: None,
      fetched_at: None,
      invalidated: false,
      version: 0,
    }
  }

  /// Whether this entry can be served without touching the network.
  pub fn is_fresh(&self, stale_time: Duration, now: Instant) -> bool {
    if self.status != QueryStatus::Success || self.invalidated || self.data.is_none() {
      return false;
    }
    self
      .fetched_at
      .map(|t| now.saturating_duration_since(t) < stale_time)
      .unwrap_or(false)
  }

  /// Decode the payload into a typed resource.
  pub fn data_as<T: DeserializeOwned>(&self) -> Option<Result<T, QueryError>> {
    self
      .data
      .as_ref()
      .map(|v| T::deserialize(v.as_ref()).map_err(QueryError::from))
  }

  fn same_state(&self, other: &CacheEntry) -> bool {
    let same_data = match (&self.data, &other.data) {
      (Some(a), Some(b)) => Arc::ptr_eq(a, b),
      (None, None) => true,
      _ => false,
    };
    same_data
      && self.status == other.status
      && self.error == other.error
      && self.fetched_at == other.fetched_at
      && self.invalidated == other.invalidated
  }
}

/// A partial update to a [`CacheEntry`]. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
  pub data: Option<Arc<Value>>,
  pub status: Option<QueryStatus>,
  pub error: Option<Option<QueryError>>,
  pub fetched_at: Option<Instant>,
  pub invalidated: Option<bool>,
}

impl EntryPatch {
  /// A fetch has started. Data is kept for stale-while-revalidate display.
  pub fn loading() -> Self {
    Self {
      status: Some(QueryStatus::Loading),
      ..Default::default()
    }
  }

  pub fn success(data: Arc<Value>, now: Instant) -> Self {
    Self {
      data: Some(data),
      status: Some(QueryStatus::Success),
      error: Some(None),
      fetched_at: Some(now),
      invalidated: Some(false),
    }
  }

  /// A fetch failed. Data is deliberately untouched.
  pub fn failure(error: QueryError) -> Self {
    Self {
      status: Some(QueryStatus::Error),
      error: Some(Some(error)),
      ..Default::default()
    }
  }

  pub fn invalidate() -> Self {
    Self {
      invalidated: Some(true),
      ..Default::default()
    }
  }

  /// Replace only the payload (optimistic patches and rollbacks).
  pub fn data(data: Value) -> Self {
    Self {
      data: Some(Arc::new(data)),
      ..Default::default()
    }
  }

  /// Keep the entry stale after a successful fetch, used when the fetch was
  /// already in flight when its key got invalidated.
  pub fn still_invalidated(mut self) -> Self {
    self.invalidated = Some(true);
    self
  }

  /// Merge this patch into `entry`, returning the resulting entry.
  ///
  /// Version is not touched here; the store owns versioning. A payload that
  /// is structurally equal to the current one keeps the current `Arc`, so
  /// views comparing by pointer see no change.
  pub fn apply(&self, entry: &CacheEntry) -> CacheEntry {
    let mut next = entry.clone();
    if let Some(data) = &self.data {
      let unchanged = next.data.as_ref().is_some_and(|cur| cur.as_ref() == data.as_ref());
      if !unchanged {
        next.data = Some(Arc::clone(data));
      }
    }
    if let Some(status) = self.status {
      next.status = status;
    }
    if let Some(error) = &self.error {
      next.error = error.clone();
    }
    if let Some(fetched_at) = self.fetched_at {
      next.fetched_at = Some(fetched_at);
    }
    if let Some(invalidated) = self.invalidated {
      next.invalidated = invalidated;
    }
    next
  }

  /// Apply and report whether anything observable changed.
  pub(crate) fn apply_changed(&self, entry: &CacheEntry) -> Option<CacheEntry> {
    let next = self.apply(entry);
    if next.same_state(entry) {
      None
    } else {
      Some(next)
    }
  }
}
