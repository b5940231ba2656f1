//! Subscription bus: routes cache entry changes to the views bound to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{CacheEntry, QueryKey};
use crate::sync::lock;

/// Identifies a mounted view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

impl ViewId {
  /// Allocate a process-unique id for a newly mounted view.
  pub fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ViewId(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

/// Callback invoked with every new snapshot of a subscribed entry
pub type Callback = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

struct Subscriber {
  view: ViewId,
  callback: Callback,
  /// One past the highest entry version delivered; older snapshots are dropped
  next_version: AtomicU64,
  /// Cleared on unsubscribe so a delivery already collected is skipped
  active: AtomicBool,
}

impl Subscriber {
  fn deliver(&self, entry: &CacheEntry) {
    if !self.active.load(Ordering::Acquire) {
      return;
    }
    let prev = self.next_version.fetch_max(entry.version + 1, Ordering::AcqRel);
    if prev <= entry.version {
      (self.callback)(entry);
    }
  }
}

/// Maps each active view to the keys it depends on.
#[derive(Default)]
pub struct SubscriptionBus {
  subscribers: Mutex<HashMap<QueryKey, Vec<Arc<Subscriber>>>>,
}

impl SubscriptionBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `view`'s interest in `key` and deliver `current` immediately.
  ///
  /// Subscribing again with the same view and key replaces the callback;
  /// returns `false` in that case.
  pub fn subscribe(
    &self,
    view: ViewId,
    key: &QueryKey,
    callback: Callback,
    current: &CacheEntry,
  ) -> bool {
    let subscriber = Arc::new(Subscriber {
      view,
      callback,
      next_version: AtomicU64::new(0),
      active: AtomicBool::new(true),
    });
    let added = {
      let mut subs = lock(&self.subscribers);
      let list = subs.entry(key.clone()).or_default();
      let existing = list.iter().position(|s| s.view == view);
      if let Some(i) = existing {
        list.remove(i).active.store(false, Ordering::Release);
      }
      list.push(Arc::clone(&subscriber));
      existing.is_none()
    };
    subscriber.deliver(current);
    added
  }

  /// Remove `view`'s subscription to `key`. Returns whether one existed;
  /// calling it again is a harmless no-op.
  pub fn unsubscribe(&self, view: ViewId, key: &QueryKey) -> bool {
    let mut subs = lock(&self.subscribers);
    let Some(list) = subs.get_mut(key) else {
      return false;
    };
    let before = list.len();
    list.retain(|s| {
      if s.view == view {
        s.active.store(false, Ordering::Release);
        false
      } else {
        true
      }
    });
    let removed = list.len() != before;
    if list.is_empty() {
      subs.remove(key);
    }
    removed
  }

  /// Deliver `entry` to every subscriber of its key, synchronously.
  ///
  /// Callbacks run after the subscriber list lock is released, so they may
  /// subscribe, unsubscribe or write to the cache themselves.
  pub fn publish(&self, entry: &CacheEntry) {
    let targets: Vec<Arc<Subscriber>> = lock(&self.subscribers)
      .get(&entry.key)
      .map(|list| list.to_vec())
      .unwrap_or_default();
    for subscriber in targets {
      subscriber.deliver(entry);
    }
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    lock(&self.subscribers).get(key).map(Vec::len).unwrap_or(0)
  }

  /// Keys with at least one live subscriber.
  pub fn active_keys(&self) -> Vec<QueryKey> {
    lock(&self.subscribers).keys().cloned().collect()
  }

  pub fn clear(&self) {
    let mut subs = lock(&self.subscribers);
    for s in subs.values().flatten() {
      s.active.store(false, Ordering::Release);
    }
    subs.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryPatch;
  use serde_json::json;

  fn recorder() -> (Callback, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let cb: Callback = Arc::new(move |e: &CacheEntry| lock(&sink).push(e.version));
    (cb, seen)
  }

  fn entry(version: u64) -> CacheEntry {
    let mut e = EntryPatch::data(json!(version)).apply(&CacheEntry::new(QueryKey::new("cart")));
    e.version = version;
    e
  }

  #[test]
  fn test_subscribe_delivers_current_snapshot() {
    let bus = SubscriptionBus::new();
    let (cb, seen) = recorder();

    assert!(bus.subscribe(ViewId(1), &QueryKey::new("cart"), cb, &entry(3)));
    assert_eq!(*lock(&seen), vec![3]);

    let (again, _) = recorder();
    assert!(!bus.subscribe(ViewId(1), &QueryKey::new("cart"), again, &entry(3)));
    assert_eq!(bus.subscriber_count(&QueryKey::new("cart")), 1);
  }

  #[test]
  fn test_publish_skips_older_versions() {
    let bus = SubscriptionBus::new();
    let (cb, seen) = recorder();
    bus.subscribe(ViewId(1), &QueryKey::new("cart"), cb, &entry(1));

    bus.publish(&entry(3));
    bus.publish(&entry(2));
    bus.publish(&entry(4));

    assert_eq!(*lock(&seen), vec![1, 3, 4]);
  }

  #[test]
  fn test_unsubscribe_is_idempotent() {
    let bus = SubscriptionBus::new();
    let key = QueryKey::new("cart");
    let (a, seen_a) = recorder();
    let (b, seen_b) = recorder();
    bus.subscribe(ViewId(1), &key, a, &entry(1));
    bus.subscribe(ViewId(2), &key, b, &entry(1));

    assert!(bus.unsubscribe(ViewId(1), &key));
    assert!(!bus.unsubscribe(ViewId(1), &key));
    assert_eq!(bus.subscriber_count(&key), 1);

    bus.publish(&entry(2));
    assert_eq!(*lock(&seen_a), vec![1]);
    assert_eq!(*lock(&seen_b), vec![1, 2]);
  }

  #[test]
  fn test_other_keys_are_not_notified() {
    let bus = SubscriptionBus::new();
    let (cb, seen) = recorder();
    bus.subscribe(ViewId(1), &QueryKey::new("orders"), cb, &CacheEntry::new(QueryKey::new("orders")));

    bus.publish(&entry(5));
    assert_eq!(*lock(&seen), vec![0]);
  }

  #[test]
  fn test_view_ids_are_unique() {
    assert_ne!(ViewId::next(), ViewId::next());
  }
}
