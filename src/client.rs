//! The application-wide query client and the two entry points views use.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{Callback, ViewId};
use crate::cache::{CacheEntry, KeyMatcher, QueryKey};
use crate::error::QueryError;
use crate::mutation::{MutationCoordinator, MutationDescriptor};
use crate::notify::NotificationSink;
use crate::query::{Fetcher, QueryCoordinator, QueryOptions, QueryResult};
use crate::state::ClientState;
use crate::sync::lock;

/// Client-wide defaults.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
  /// How long an entry nobody subscribes to survives before eviction
  pub gc_time: Duration,
  /// Freshness window for queries that do not set their own
  pub default_stale_time: Duration,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      gc_time: Duration::from_secs(5 * 60),
      default_stale_time: Duration::ZERO,
    }
  }
}

/// Owns the cache and both coordinators.
///
/// Create one at startup and pass it (or clones of it, which share state)
/// to everything that reads or writes server resources.
#[derive(Clone)]
pub struct QueryClient {
  state: Arc<ClientState>,
  queries: QueryCoordinator,
  mutations: MutationCoordinator,
  options: ClientOptions,
}

impl QueryClient {
  pub fn new(options: ClientOptions, sink: Arc<dyn NotificationSink>) -> Self {
    let state = Arc::new(ClientState::new(options.gc_time));
    let queries = QueryCoordinator::new(Arc::clone(&state));
    let mutations = MutationCoordinator::new(Arc::clone(&state), queries.clone(), sink);
    Self {
      state,
      queries,
      mutations,
      options,
    }
  }

  pub fn queries(&self) -> &QueryCoordinator {
    &self.queries
  }

  pub fn mutations(&self) -> &MutationCoordinator {
    &self.mutations
  }

  /// Query options seeded with the client's default stale time.
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions::default().with_stale_time(self.options.default_stale_time)
  }

  /// Bind `view` to `key`.
  ///
  /// `on_change` runs immediately with the current state and again on every
  /// change until the returned handle is dropped. A fetch starts in the
  /// background unless the cached data is fresh or the query is disabled.
  pub fn use_query<F>(
    &self,
    view: ViewId,
    key: QueryKey,
    fetcher: Fetcher,
    options: QueryOptions,
    on_change: F,
  ) -> QueryHandle
  where
    F: Fn(&QueryResult) + Send + Sync + 'static,
  {
    self.queries.register(&key, fetcher, options);

    let current = {
      let mut store = lock(&self.state.store);
      store.retain(&key);
      store.ensure(&key).clone()
    };

    let stale_time = options.stale_time;
    let callback: Callback = Arc::new(move |entry: &CacheEntry| {
      on_change(&QueryResult::from_entry(entry, stale_time, Instant::now()))
    });
    if !self.state.bus.subscribe(view, &key, callback, &current) {
      // Same view re-bound the key: it already holds a reference
      lock(&self.state.store).release(&key, Instant::now());
    }
    debug!(view = view.0, key = %key, "view subscribed");

    self.queries.ensure_fresh(&key);

    QueryHandle {
      client: self.clone(),
      view,
      key,
      stale_time,
      released: AtomicBool::new(false),
    }
  }

  /// Wrap `descriptor` for a view: the returned handle runs it and reports
  /// whether a run is in progress.
  pub fn use_mutation<I>(&self, descriptor: MutationDescriptor<I>) -> MutationHandle<I>
  where
    I: Clone + Send + 'static,
  {
    MutationHandle {
      mutations: self.mutations.clone(),
      descriptor,
      pending: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Read `key` once without subscribing.
  pub async fn query(
    &self,
    key: &QueryKey,
    fetcher: Fetcher,
    options: QueryOptions,
  ) -> Result<Arc<Value>, QueryError> {
    self.queries.register(key, fetcher, options);
    if !options.enabled {
      return self
        .queries
        .get_query_data(key)
        .ok_or_else(|| QueryError::validation(format!("query {} is disabled", key)));
    }
    self.queries.fetch_registered(key, options.stale_time).await
  }

  /// Mark matching entries stale and refetch the ones views are bound to.
  pub async fn invalidate_queries(&self, matcher: impl Into<KeyMatcher>) {
    self.queries.invalidate(&matcher.into()).await;
  }

  pub fn get_query_data(&self, key: &QueryKey) -> Option<Arc<Value>> {
    self.queries.get_query_data(key)
  }

  pub fn set_query_data(&self, key: &QueryKey, value: Value) {
    self.queries.set_query_data(key, value);
  }

  /// Snapshot of the entry for `key`.
  pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.state.snapshot(key)
  }

  pub fn cached_keys(&self) -> usize {
    lock(&self.state.store).len()
  }

  /// Forget everything: entries, subscriptions, pending optimistic state.
  pub fn reset(&self) {
    self.queries.clear();
    self.state.clear();
  }
}

/// A view's binding to one query key. Dropping it unsubscribes.
pub struct QueryHandle {
  client: QueryClient,
  view: ViewId,
  key: QueryKey,
  stale_time: Duration,
  released: AtomicBool,
}

impl QueryHandle {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn view(&self) -> ViewId {
    self.view
  }

  /// Current `{data, status, error}` for this key.
  pub fn result(&self) -> QueryResult {
    self
      .client
      .entry(&self.key)
      .map(|e| QueryResult::from_entry(&e, self.stale_time, Instant::now()))
      .unwrap_or_else(QueryResult::idle)
  }

  /// Refetch regardless of freshness.
  pub async fn refetch(&self) -> Result<Arc<Value>, QueryError> {
    self.client.queries.refetch(&self.key).await
  }

  /// Release the subscription now instead of on drop. Safe to call twice.
  pub fn unsubscribe(&self) {
    if self.released.swap(true, Ordering::AcqRel) {
      return;
    }
    self.client.state.bus.unsubscribe(self.view, &self.key);
    self.client.queries.release(&self.key);
    debug!(view = self.view.0, key = %self.key, "view unsubscribed");
  }
}

impl Drop for QueryHandle {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

impl std::fmt::Debug for QueryHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryHandle")
      .field("view", &self.view)
      .field("key", &self.key)
      .finish_non_exhaustive()
  }
}

/// A view's handle on one kind of mutation.
pub struct MutationHandle<I> {
  mutations: MutationCoordinator,
  descriptor: MutationDescriptor<I>,
  pending: Arc<AtomicUsize>,
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::AcqRel);
  }
}

impl<I: Clone + Send + 'static> MutationHandle<I> {
  pub async fn run(&self, input: I) -> Result<Value, QueryError> {
    self.pending.fetch_add(1, Ordering::AcqRel);
    let _guard = PendingGuard(Arc::clone(&self.pending));
    self.mutations.mutate(&self.descriptor, input).await
  }

  pub fn is_pending(&self) -> bool {
    self.pending.load(Ordering::Acquire) > 0
  }

  pub fn name(&self) -> &'static str {
    self.descriptor.name
  }
}
