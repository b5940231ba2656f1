//! State shared by the query and mutation coordinators.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::bus::SubscriptionBus;
use crate::cache::{CacheEntry, CacheStore, EntryPatch, OptimisticLedger, QueryKey};
use crate::sync::lock;

/// The single cache instance plus everything that observes or patches it.
///
/// Lock order is `ledger` before `store`; neither is held while the bus
/// runs callbacks.
pub(crate) struct ClientState {
  pub store: Mutex<CacheStore>,
  pub ledger: Mutex<OptimisticLedger>,
  pub bus: SubscriptionBus,
}

impl ClientState {
  pub fn new(gc_time: Duration) -> Self {
    Self {
      store: Mutex::new(CacheStore::new(gc_time)),
      ledger: Mutex::new(OptimisticLedger::new()),
      bus: SubscriptionBus::new(),
    }
  }

  pub fn snapshot(&self, key: &QueryKey) -> Option<CacheEntry> {
    lock(&self.store).get(key).cloned()
  }

  /// Apply `patch` to `key` and notify its subscribers if anything changed.
  pub fn write(&self, key: &QueryKey, patch: &EntryPatch) -> Option<CacheEntry> {
    let snapshot = lock(&self.store).set(key, patch);
    if let Some(entry) = &snapshot {
      self.bus.publish(entry);
    }
    snapshot
  }

  /// Store data that came from the server, replaying any optimistic layers
  /// still pending on `key`. Returns the snapshot to publish; publishing is
  /// left to the caller so it can release its own locks first.
  pub fn store_server_data(
    &self,
    key: &QueryKey,
    value: Value,
    now: Instant,
    keep_invalidated: bool,
  ) -> Option<CacheEntry> {
    let mut ledger = lock(&self.ledger);
    let value = if ledger.has_pending(key) {
      ledger.rebase(key, &value)
    } else {
      value
    };
    let mut patch = EntryPatch::success(Arc::new(value), now);
    if keep_invalidated {
      patch = patch.still_invalidated();
    }
    lock(&self.store).set(key, &patch)
  }

  /// Current payload for `key`.
  pub fn data(&self, key: &QueryKey) -> Option<Arc<Value>> {
    lock(&self.store).get(key).and_then(|e| e.data.clone())
  }

  pub fn clear(&self) {
    lock(&self.ledger).clear();
    lock(&self.store).clear();
    self.bus.clear();
  }
}
