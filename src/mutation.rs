//! Mutation coordination: writes with optimistic updates, rollback,
//! notifications and invalidation of dependent queries.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, EntryPatch, KeyMatcher, MutationId, OptimisticPatch};
use crate::error::QueryError;
use crate::notify::{Notification, NotificationSink};
use crate::query::QueryCoordinator;
use crate::state::ClientState;
use crate::sync::lock;

/// A boxed write future resolving to the server's JSON response
pub type WriteFuture = BoxFuture<'static, Result<Value, QueryError>>;

type ActionFn<I> = Arc<dyn Fn(I) -> WriteFuture + Send + Sync>;
type ValidateFn<I> = Arc<dyn Fn(&I) -> Result<(), QueryError> + Send + Sync>;
type OptimisticFn<I> = Arc<dyn Fn(&I) -> Vec<OptimisticPatch> + Send + Sync>;
type InvalidatesFn<I> = Arc<dyn Fn(&I) -> Vec<KeyMatcher> + Send + Sync>;
type SuccessFn<I> = Arc<dyn Fn(&I, &Value) -> Notification + Send + Sync>;
type ErrorFn<I> = Arc<dyn Fn(&I, &QueryError) -> Notification + Send + Sync>;

/// Everything needed to run one kind of write.
///
/// ```ignore
/// let add = MutationDescriptor::new("add_to_cart", move |input: AddToCart| {
///   let api = api.clone();
///   async move { api.add_to_cart(&input).await }
/// })
/// .invalidates(vec![QueryKey::new("cart").into()])
/// .on_success(|_, _| Notification::success("Added to cart!", "Item added to your cart successfully."));
/// ```
pub struct MutationDescriptor<I> {
  pub name: &'static str,
  action: ActionFn<I>,
  validate: Option<ValidateFn<I>>,
  optimistic: Option<OptimisticFn<I>>,
  invalidates: InvalidatesFn<I>,
  on_success: SuccessFn<I>,
  on_error: ErrorFn<I>,
}

impl<I> Clone for MutationDescriptor<I> {
  fn clone(&self) -> Self {
    Self {
      name: self.name,
      action: Arc::clone(&self.action),
      validate: self.validate.clone(),
      optimistic: self.optimistic.clone(),
      invalidates: Arc::clone(&self.invalidates),
      on_success: Arc::clone(&self.on_success),
      on_error: Arc::clone(&self.on_error),
    }
  }
}

impl<I: Send + 'static> MutationDescriptor<I> {
  pub fn new<F, Fut, T>(name: &'static str, action: F) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    T: Serialize,
  {
    Self {
      name,
      action: Arc::new(move |input: I| {
        let fut = action(input);
        async move {
          let out = fut.await?;
          Ok(serde_json::to_value(out)?)
        }
        .boxed()
      }),
      validate: None,
      optimistic: None,
      invalidates: Arc::new(|_: &I| Vec::new()),
      on_success: Arc::new(move |_: &I, _: &Value| {
        Notification::success("Success!", format!("{} completed.", name))
      }),
      on_error: Arc::new(|_: &I, err: &QueryError| {
        Notification::error("Error", err.user_message("Something went wrong.").to_string())
      }),
    }
  }

  /// Reject input before anything is patched or sent.
  pub fn validate<F>(mut self, f: F) -> Self
  where
    F: Fn(&I) -> Result<(), QueryError> + Send + Sync + 'static,
  {
    self.validate = Some(Arc::new(f));
    self
  }

  pub fn optimistic<F>(mut self, f: F) -> Self
  where
    F: Fn(&I) -> Vec<OptimisticPatch> + Send + Sync + 'static,
  {
    self.optimistic = Some(Arc::new(f));
    self
  }

  /// Keys to invalidate after a successful write.
  pub fn invalidates(mut self, matchers: Vec<KeyMatcher>) -> Self {
    self.invalidates = Arc::new(move |_: &I| matchers.clone());
    self
  }

  /// Keys to invalidate, computed from the input.
  pub fn invalidates_with<F>(mut self, f: F) -> Self
  where
    F: Fn(&I) -> Vec<KeyMatcher> + Send + Sync + 'static,
  {
    self.invalidates = Arc::new(f);
    self
  }

  pub fn on_success<F>(mut self, f: F) -> Self
  where
    F: Fn(&I, &Value) -> Notification + Send + Sync + 'static,
  {
    self.on_success = Arc::new(f);
    self
  }

  pub fn on_error<F>(mut self, f: F) -> Self
  where
    F: Fn(&I, &QueryError) -> Notification + Send + Sync + 'static,
  {
    self.on_error = Arc::new(f);
    self
  }
}

/// Rolls back a mutation's optimistic layers if its future is dropped
/// before the write settles.
struct PendingLayers<'a> {
  mutations: &'a MutationCoordinator,
  id: MutationId,
  name: &'static str,
  settled: bool,
}

impl Drop for PendingLayers<'_> {
  fn drop(&mut self) {
    if !self.settled {
      warn!(mutation = self.name, id = self.id.0, "mutation cancelled before settling");
      self.mutations.rollback(self.id);
    }
  }
}

/// Runs mutations against the shared cache.
#[derive(Clone)]
pub struct MutationCoordinator {
  state: Arc<ClientState>,
  queries: QueryCoordinator,
  sink: Arc<dyn NotificationSink>,
  next_id: Arc<AtomicU64>,
}

impl MutationCoordinator {
  pub(crate) fn new(
    state: Arc<ClientState>,
    queries: QueryCoordinator,
    sink: Arc<dyn NotificationSink>,
  ) -> Self {
    Self {
      state,
      queries,
      sink,
      next_id: Arc::new(AtomicU64::new(1)),
    }
  }

  /// Run `descriptor` once with `input`.
  ///
  /// The sink is notified exactly once whatever the outcome. On success the
  /// declared keys are invalidated and subscribed ones refetched before this
  /// returns; on failure every optimistic field is restored. Dropping the
  /// returned future before the write settles also restores them, without
  /// a notification.
  pub async fn mutate<I>(&self, descriptor: &MutationDescriptor<I>, input: I) -> Result<Value, QueryError>
  where
    I: Clone + Send + 'static,
  {
    let name = descriptor.name;

    if let Some(validate) = &descriptor.validate {
      if let Err(err) = validate(&input) {
        warn!(mutation = name, error = %err, "mutation rejected");
        self.sink.notify(Notification::error("Validation Error", err.message.clone()));
        return Err(err);
      }
    }

    let id = MutationId(self.next_id.fetch_add(1, Ordering::Relaxed));
    let mut pending = PendingLayers {
      mutations: self,
      id,
      name,
      settled: false,
    };
    if let Some(optimistic) = &descriptor.optimistic {
      self.apply_optimistic(id, optimistic(&input));
    }

    debug!(mutation = name, id = id.0, "running mutation");
    let result = (descriptor.action)(input.clone()).await;
    pending.settled = true;

    match result {
      Ok(response) => {
        lock(&self.state.ledger).commit(id);
        info!(mutation = name, id = id.0, "mutation succeeded");
        self.sink.notify((descriptor.on_success)(&input, &response));

        let matchers = (descriptor.invalidates)(&input);
        futures::future::join_all(matchers.iter().map(|m| self.queries.invalidate(m))).await;
        Ok(response)
      }
      Err(err) => {
        self.rollback(id);
        warn!(mutation = name, id = id.0, error = %err, "mutation failed");
        self.sink.notify((descriptor.on_error)(&input, &err));
        Err(err)
      }
    }
  }

  fn apply_optimistic(&self, id: MutationId, patches: Vec<OptimisticPatch>) {
    let snapshots: Vec<CacheEntry> = {
      let mut ledger = lock(&self.state.ledger);
      let mut store = lock(&self.state.store);
      let mut out = Vec::new();
      for patch in patches {
        for key in store.keys_matching(&patch.target) {
          let Some(current) = store.get(&key).and_then(|e| e.data.clone()) else {
            continue;
          };
          let next = ledger.apply(id, &key, patch.ops.clone(), &current);
          if let Some(entry) = store.set(&key, &EntryPatch::data(next)) {
            out.push(entry);
          }
        }
      }
      out
    };
    for entry in &snapshots {
      debug!(key = %entry.key, id = id.0, "applied optimistic patch");
      self.state.bus.publish(entry);
    }
  }

  fn rollback(&self, id: MutationId) {
    let snapshots: Vec<CacheEntry> = {
      let mut ledger = lock(&self.state.ledger);
      let mut store = lock(&self.state.store);
      let mut out = Vec::new();
      for key in ledger.keys_for(id) {
        // An evicted entry has nothing to restore; just drop the layer
        let current = store
          .get(&key)
          .and_then(|e| e.data.clone())
          .map(|d| d.as_ref().clone())
          .unwrap_or(Value::Null);
        let Some(restored) = ledger.rollback(id, &key, &current) else {
          continue;
        };
        if store.get(&key).is_some() {
          if let Some(entry) = store.set(&key, &EntryPatch::data(restored)) {
            out.push(entry);
          }
        }
      }
      out
    };
    for entry in &snapshots {
      debug!(key = %entry.key, id = id.0, "rolled back optimistic patch");
      self.state.bus.publish(entry);
    }
  }
}
