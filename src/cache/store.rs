//! In-memory keyed store of cache entries.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, EntryPatch, QueryStatus};
use super::key::{KeyMatcher, QueryKey};

struct Slot {
  entry: CacheEntry,
  /// Live subscriptions holding this entry
  refs: usize,
  /// When `refs` last dropped to zero (or creation time if never referenced)
  unreferenced_since: Option<Instant>,
}

/// Process-wide keyed store of query results.
///
/// Not synchronized itself: the client owns exactly one behind a mutex and
/// every write goes through [`CacheStore::set`].
pub struct CacheStore {
  slots: HashMap<QueryKey, Slot>,
  /// Grace period before an unreferenced entry may be evicted
  gc_time: Duration,
}

impl CacheStore {
  pub fn new(gc_time: Duration) -> Self {
    Self {
      slots: HashMap::new(),
      gc_time,
    }
  }

  pub fn gc_time(&self) -> Duration {
    self.gc_time
  }

  pub fn get(&self, key: &QueryKey) -> Option<&CacheEntry> {
    self.slots.get(key).map(|s| &s.entry)
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// Create an Idle entry for `key` if none exists.
  pub fn ensure(&mut self, key: &QueryKey) -> &CacheEntry {
    &self
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot {
        entry: CacheEntry::new(key.clone()),
        refs: 0,
        unreferenced_since: Some(Instant::now()),
      })
      .entry
  }

  /// Merge `patch` into the entry for `key`, creating it if needed.
  ///
  /// Returns the new snapshot when something changed (and the version was
  /// bumped), `None` when the patch was a no-op.
  pub fn set(&mut self, key: &QueryKey, patch: &EntryPatch) -> Option<CacheEntry> {
    self.ensure(key);
    let slot = self.slots.get_mut(key)?;
    let mut next = patch.apply_changed(&slot.entry)?;
    next.version = slot.entry.version + 1;
    slot.entry = next;
    Some(slot.entry.clone())
  }

  /// Register one more live subscription on `key`.
  pub fn retain(&mut self, key: &QueryKey) {
    self.ensure(key);
    if let Some(slot) = self.slots.get_mut(key) {
      slot.refs += 1;
      slot.unreferenced_since = None;
    }
  }

  /// Drop one subscription; returns the remaining count.
  pub fn release(&mut self, key: &QueryKey, now: Instant) -> usize {
    match self.slots.get_mut(key) {
      Some(slot) => {
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 && slot.unreferenced_since.is_none() {
          slot.unreferenced_since = Some(now);
        }
        slot.refs
      }
      None => 0,
    }
  }

  pub fn ref_count(&self, key: &QueryKey) -> usize {
    self.slots.get(key).map(|s| s.refs).unwrap_or(0)
  }

  fn evictable(&self, slot: &Slot, now: Instant) -> bool {
    slot.refs == 0
      && slot.entry.status != QueryStatus::Loading
      && slot
        .unreferenced_since
        .is_some_and(|since| now.saturating_duration_since(since) >= self.gc_time)
  }

  /// Remove `key` if nothing references it, it is not loading, and the
  /// grace period has passed.
  pub fn evict_if_unreferenced(&mut self, key: &QueryKey, now: Instant) -> bool {
    let evict = self
      .slots
      .get(key)
      .is_some_and(|slot| self.evictable(slot, now));
    if evict {
      self.slots.remove(key);
      debug!(key = %key, "evicted cache entry");
    }
    evict
  }

  /// Evict every entry eligible for removal, returning their keys.
  pub fn collect_garbage(&mut self, now: Instant) -> Vec<QueryKey> {
    let doomed: Vec<QueryKey> = self
      .slots
      .iter()
      .filter(|(_, slot)| self.evictable(slot, now))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &doomed {
      self.slots.remove(key);
      debug!(key = %key, "evicted cache entry");
    }
    doomed
  }

  pub fn keys_matching(&self, matcher: &KeyMatcher) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self
      .slots
      .keys()
      .filter(|k| matcher.matches(k))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Drop every entry regardless of references.
  pub fn clear(&mut self) {
    self.slots.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;

  fn cart() -> QueryKey {
    QueryKey::new("cart")
  }

  #[test]
  fn test_set_bumps_version_only_on_change() {
    let mut store = CacheStore::new(Duration::ZERO);
    let now = Instant::now();

    let first = store
      .set(&cart(), &EntryPatch::success(Arc::new(json!({"items": []})), now))
      .expect("first write changes the entry");
    assert_eq!(first.version, 1);

    // Same status and an equal payload: nothing observable changes
    assert!(store.set(&cart(), &EntryPatch::data(json!({"items": []}))).is_none());
    assert_eq!(store.get(&cart()).map(|e| e.version), Some(1));

    let loading = store.set(&cart(), &EntryPatch::loading());
    assert_eq!(loading.map(|e| e.version), Some(2));
  }

  #[test]
  fn test_referenced_entry_is_never_evicted() {
    let mut store = CacheStore::new(Duration::ZERO);
    store.retain(&cart());

    assert!(!store.evict_if_unreferenced(&cart(), Instant::now()));

    assert_eq!(store.release(&cart(), Instant::now()), 0);
    assert!(store.evict_if_unreferenced(&cart(), Instant::now()));
    assert!(store.get(&cart()).is_none());
  }

  #[test]
  fn test_loading_entry_is_never_evicted() {
    let mut store = CacheStore::new(Duration::ZERO);
    store.set(&cart(), &EntryPatch::loading());

    assert!(store.collect_garbage(Instant::now()).is_empty());
    assert!(store.get(&cart()).is_some());
  }

  #[test]
  fn test_grace_period() {
    let mut store = CacheStore::new(Duration::from_secs(60));
    let start = Instant::now();
    store.retain(&cart());
    store.release(&cart(), start);

    assert!(!store.evict_if_unreferenced(&cart(), start + Duration::from_secs(30)));
    assert!(store.evict_if_unreferenced(&cart(), start + Duration::from_secs(60)));
  }

  #[test]
  fn test_release_is_saturating() {
    let mut store = CacheStore::new(Duration::ZERO);
    store.ensure(&cart());
    assert_eq!(store.release(&cart(), Instant::now()), 0);
    assert_eq!(store.release(&QueryKey::new("missing"), Instant::now()), 0);
  }
}
