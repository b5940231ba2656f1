//! Query coordination: cached reads with deduplicated background fetching.
//!
//! Inspired by TanStack Query. A query is identified by a structural
//! [`QueryKey`] and backed by a fetcher closure. Reading a key:
//!
//! 1. Fresh cached data is returned immediately, no fetch
//! 2. If a fetch for the key is already in flight, the caller joins it
//! 3. Otherwise a fetch is spawned, the entry goes to Loading (keeping any
//!    previous data on display) and every subscriber is notified when it
//!    settles
//!
//! # Example
//!
//! ```ignore
//! let api = api.clone();
//! let product = queries
//!   .query(
//!     &QueryKey::new("product").with("1"),
//!     fetcher(move || {
//!       let api = api.clone();
//!       async move { api.product("1").await }
//!     }),
//!     Duration::from_secs(300),
//!   )
//!   .await?;
//! ```

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, EntryPatch, KeyMatcher, QueryKey, QueryStatus};
use crate::error::QueryError;
use crate::state::ClientState;
use crate::sync::lock;

/// A boxed future resolving to a JSON payload
pub type BoxFetch = BoxFuture<'static, Result<Value, QueryError>>;

/// A factory function that creates futures for fetching data
pub type Fetcher = Arc<dyn Fn() -> BoxFetch + Send + Sync>;

/// Wrap a typed async closure as a [`Fetcher`].
///
/// The fetcher is called each time the query needs network data.
///
/// ```ignore
/// let api = api.clone();
/// let f = fetcher(move || {
///   let api = api.clone();
///   async move { api.cart().await }
/// });
/// ```
pub fn fetcher<F, Fut, T>(f: F) -> Fetcher
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  T: Serialize,
{
  Arc::new(move || {
    let fut = f();
    async move {
      let data = fut.await?;
      Ok(serde_json::to_value(data)?)
    }
    .boxed()
  })
}

/// Per-query behaviour.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
  /// How long fetched data is served without refetching
  pub stale_time: Duration,
  /// Disabled queries never fetch (e.g. a detail view with no id yet)
  pub enabled: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::ZERO,
      enabled: true,
    }
  }
}

impl QueryOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }
}

/// What a view sees for one query.
#[derive(Debug, Clone)]
pub struct QueryResult {
  pub data: Option<Arc<Value>>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  /// Invalidated, or older than the query's stale time
  pub is_stale: bool,
}

impl QueryResult {
  pub fn idle() -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      error: None,
      is_stale: true,
    }
  }

  pub(crate) fn from_entry(entry: &CacheEntry, stale_time: Duration, now: Instant) -> Self {
    Self {
      data: entry.data.clone(),
      status: entry.status,
      error: entry.error.clone(),
      is_stale: !entry.is_fresh(stale_time, now),
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  /// A fetch is running. Previous data, if any, is still in `data`.
  pub fn is_fetching(&self) -> bool {
    self.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&Value> {
    self.data.as_deref()
  }

  /// Decode the payload into a typed resource.
  pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, QueryError>> {
    self
      .data
      .as_ref()
      .map(|v| T::deserialize(v.as_ref()).map_err(QueryError::from))
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.error.as_ref()
  }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Value>, QueryError>>>;

struct Registration {
  fetcher: Fetcher,
  options: QueryOptions,
}

struct InFlightRequest {
  shared: SharedFetch,
  /// Callers that have joined this request, the starter included. Callers
  /// that stop waiting are not subtracted.
  joined: usize,
  /// The key was invalidated while this fetch was outstanding, so its
  /// result may predate the write and must be stored as stale
  invalidated: bool,
}

struct QueryInner {
  state: Arc<ClientState>,
  registry: Mutex<HashMap<QueryKey, Registration>>,
  in_flight: Mutex<HashMap<QueryKey, InFlightRequest>>,
}

/// Resolves query keys to cached or freshly fetched data.
///
/// Cheap to clone; clones share the same cache. Fetches run on spawned
/// tokio tasks, so this must be used from within a runtime.
#[derive(Clone)]
pub struct QueryCoordinator {
  inner: Arc<QueryInner>,
}

impl QueryCoordinator {
  pub(crate) fn new(state: Arc<ClientState>) -> Self {
    Self {
      inner: Arc::new(QueryInner {
        state,
        registry: Mutex::new(HashMap::new()),
        in_flight: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Remember how to fetch `key`. Later registrations replace earlier ones.
  pub fn register(&self, key: &QueryKey, fetcher: Fetcher, options: QueryOptions) {
    lock(&self.inner.registry).insert(key.clone(), Registration { fetcher, options });
  }

  pub fn options(&self, key: &QueryKey) -> Option<QueryOptions> {
    lock(&self.inner.registry).get(key).map(|r| r.options)
  }

  /// Read `key`, fetching with `fetcher` unless fresh data is cached.
  pub async fn query(
    &self,
    key: &QueryKey,
    fetcher: Fetcher,
    stale_time: Duration,
  ) -> Result<Arc<Value>, QueryError> {
    let options = QueryOptions::default().with_stale_time(stale_time);
    self.register(key, fetcher, options);
    self.fetch_registered(key, stale_time).await
  }

  /// Read `key` using its registered fetcher.
  pub async fn fetch_registered(
    &self,
    key: &QueryKey,
    stale_time: Duration,
  ) -> Result<Arc<Value>, QueryError> {
    if let Some(data) = self.fresh_data(key, stale_time) {
      debug!(key = %key, "cache hit");
      return Ok(data);
    }
    self.join_or_start(key)?.await
  }

  /// Fetch `key` in the background unless it is fresh, disabled or already
  /// in flight. Returns whether a fetch is now running.
  pub fn ensure_fresh(&self, key: &QueryKey) -> bool {
    let Some(options) = self.options(key) else {
      return false;
    };
    if !options.enabled || self.fresh_data(key, options.stale_time).is_some() {
      return false;
    }
    self.join_or_start(key).is_ok()
  }

  /// Warm the cache for `key` with its registered fetcher, honouring its
  /// stale time. Disabled queries are left alone.
  pub async fn prefetch(&self, key: &QueryKey) -> Result<Option<Arc<Value>>, QueryError> {
    let options = self
      .options(key)
      .ok_or_else(|| QueryError::validation(format!("no fetcher registered for {}", key)))?;
    if !options.enabled {
      return Ok(None);
    }
    self.fetch_registered(key, options.stale_time).await.map(Some)
  }

  /// Refetch `key` regardless of freshness.
  ///
  /// A fetch that started before this call may carry pre-write data, so it
  /// is waited out and a new one is issued (or joined, if another caller
  /// got there first).
  pub async fn refetch(&self, key: &QueryKey) -> Result<Arc<Value>, QueryError> {
    let pending = lock(&self.inner.in_flight)
      .get(key)
      .map(|req| req.shared.clone());
    if let Some(pending) = pending {
      let _ = pending.await;
    }
    self.join_or_start(key)?.await
  }

  /// Mark every matching entry stale and refetch the ones a view is
  /// currently subscribed to. Resolves once those refetches settle; their
  /// failures are recorded on the entries, not returned.
  pub async fn invalidate(&self, matcher: &KeyMatcher) {
    let (keys, snapshots) = {
      let mut store = lock(&self.inner.state.store);
      let keys = store.keys_matching(matcher);
      let snapshots: Vec<CacheEntry> = keys
        .iter()
        .filter_map(|k| store.set(k, &EntryPatch::invalidate()))
        .collect();
      (keys, snapshots)
    };
    for req in lock(&self.inner.in_flight)
      .iter_mut()
      .filter(|(k, _)| matcher.matches(k))
      .map(|(_, req)| req)
    {
      req.invalidated = true;
    }
    for entry in &snapshots {
      self.inner.state.bus.publish(entry);
    }

    let active: Vec<QueryKey> = keys
      .into_iter()
      .filter(|k| self.inner.state.bus.subscriber_count(k) > 0)
      .filter(|k| self.options(k).is_some_and(|o| o.enabled))
      .collect();
    debug!(matcher = ?matcher, active = active.len(), "invalidated queries");

    futures::future::join_all(active.iter().map(|k| self.refetch(k))).await;
  }

  pub fn get_query_data(&self, key: &QueryKey) -> Option<Arc<Value>> {
    self.inner.state.data(key)
  }

  /// Write `value` as if the server had just returned it.
  pub fn set_query_data(&self, key: &QueryKey, value: Value) -> Option<CacheEntry> {
    let snapshot = self
      .inner
      .state
      .store_server_data(key, value, Instant::now(), false);
    if let Some(entry) = &snapshot {
      self.inner.state.bus.publish(entry);
    }
    snapshot
  }

  /// Number of callers that have joined the in-flight fetch for `key` since
  /// it started. This is a join count, not a live count of waiters.
  pub fn in_flight_joins(&self, key: &QueryKey) -> Option<usize> {
    lock(&self.inner.in_flight).get(key).map(|r| r.joined)
  }

  /// Drop one view's hold on `key` and evict it once unreferenced long enough.
  pub(crate) fn release(&self, key: &QueryKey) {
    let now = Instant::now();
    let (remaining, gc_time) = {
      let mut store = lock(&self.inner.state.store);
      (store.release(key, now), store.gc_time())
    };
    if remaining > 0 {
      return;
    }
    if gc_time.is_zero() {
      self.collect_garbage(now);
    } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
      let this = self.clone();
      runtime.spawn(async move {
        tokio::time::sleep(gc_time).await;
        this.collect_garbage(Instant::now());
      });
    }
  }

  /// Evict unreferenced entries past their grace period, with their fetchers.
  pub fn collect_garbage(&self, now: Instant) -> usize {
    let evicted = lock(&self.inner.state.store).collect_garbage(now);
    if !evicted.is_empty() {
      let mut registry = lock(&self.inner.registry);
      for key in &evicted {
        registry.remove(key);
      }
    }
    evicted.len()
  }

  pub(crate) fn clear(&self) {
    lock(&self.inner.in_flight).clear();
    lock(&self.inner.registry).clear();
  }

  fn fresh_data(&self, key: &QueryKey, stale_time: Duration) -> Option<Arc<Value>> {
    let store = lock(&self.inner.state.store);
    store
      .get(key)
      .filter(|e| e.is_fresh(stale_time, Instant::now()))
      .and_then(|e| e.data.clone())
  }

  /// Attach to the in-flight fetch for `key`, or start one.
  fn join_or_start(&self, key: &QueryKey) -> Result<SharedFetch, QueryError> {
    let (shared, loading) = {
      let mut in_flight = lock(&self.inner.in_flight);
      if let Some(req) = in_flight.get_mut(key) {
        req.joined += 1;
        debug!(key = %key, joined = req.joined, "joined in-flight fetch");
        return Ok(req.shared.clone());
      }

      let fetch = lock(&self.inner.registry)
        .get(key)
        .map(|r| Arc::clone(&r.fetcher))
        .ok_or_else(|| QueryError::validation(format!("no fetcher registered for {}", key)))?;

      let loading = lock(&self.inner.state.store).set(key, &EntryPatch::loading());

      debug!(key = %key, "starting fetch");
      let this = self.clone();
      let task_key = key.clone();
      let handle = tokio::spawn(async move {
        // The fetcher itself may panic before returning a future
        let result = match AssertUnwindSafe(async move { fetch().await }).catch_unwind().await {
          Ok(result) => result,
          Err(_) => Err(QueryError::network("fetcher panicked")),
        };
        this.settle(&task_key, result)
      });

      let shared = async move {
        handle
          .await
          .unwrap_or_else(|e| Err(QueryError::network(format!("fetch task failed: {}", e))))
      }
      .boxed()
      .shared();

      in_flight.insert(
        key.clone(),
        InFlightRequest {
          shared: shared.clone(),
          joined: 1,
          invalidated: false,
        },
      );
      (shared, loading)
    };

    if let Some(entry) = &loading {
      self.inner.state.bus.publish(entry);
    }
    Ok(shared)
  }

  /// Record a fetch result. Runs on the fetch task even if nobody awaits it.
  fn settle(
    &self,
    key: &QueryKey,
    result: Result<Value, QueryError>,
  ) -> Result<Arc<Value>, QueryError> {
    let now = Instant::now();
    let (snapshot, outcome) = {
      let mut in_flight = lock(&self.inner.in_flight);
      let invalidated = in_flight
        .remove(key)
        .map(|req| req.invalidated)
        .unwrap_or(false);

      match result {
        Ok(value) => {
          let snapshot = self
            .inner
            .state
            .store_server_data(key, value, now, invalidated);
          let data = self
            .inner
            .state
            .data(key)
            .ok_or_else(|| QueryError::network(format!("entry for {} vanished", key)));
          (snapshot, data)
        }
        Err(err) => {
          warn!(key = %key, error = %err, "fetch failed");
          let snapshot = lock(&self.inner.state.store).set(key, &EntryPatch::failure(err.clone()));
          (snapshot, Err(err))
        }
      }
    };

    if let Some(entry) = &snapshot {
      self.inner.state.bus.publish(entry);
    }
    self.collect_garbage(now);
    outcome
  }
}

impl std::fmt::Debug for QueryCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryCoordinator")
      .field("registered", &lock(&self.inner.registry).len())
      .field("in_flight", &lock(&self.inner.in_flight).len())
      .finish_non_exhaustive()
  }
}
