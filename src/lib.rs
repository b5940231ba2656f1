//! Reactive data cache and mutation coordination for the EcoFinds
//! marketplace client.
//!
//! A single [`QueryClient`] owns the cache. Views bind to query keys with
//! [`QueryClient::use_query`] and are re-notified whenever the entry
//! changes; writes go through [`QueryClient::use_mutation`], which applies
//! optimistic patches, notifies the [`NotificationSink`] and invalidates the
//! keys the write affects.
//!
//! ```ignore
//! let client = QueryClient::new(ClientOptions::default(), Arc::new(TracingSink));
//! let market = Market::new(client.clone(), Arc::new(ApiClient::new(&config)?));
//!
//! let badge = market.use_cart(ViewId::next(), |r| render_badge(r));
//! let add = client.use_mutation(market.add_to_cart());
//! add.run(AddToCart::new("1")).await?;
//! ```

pub mod bus;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod market;
pub mod mutation;
pub mod notify;
pub mod query;
mod state;
mod sync;
pub mod telemetry;

pub use bus::ViewId;
pub use cache::{CacheEntry, KeyMatcher, KeyPart, OptimisticPatch, PatchOp, QueryKey, QueryStatus};
pub use client::{ClientOptions, MutationHandle, QueryClient, QueryHandle};
pub use error::{ErrorKind, QueryError};
pub use mutation::{MutationCoordinator, MutationDescriptor};
pub use notify::{Notification, NotificationSink, Severity, ToastQueue, TracingSink};
pub use query::{fetcher, Fetcher, QueryCoordinator, QueryOptions, QueryResult};
