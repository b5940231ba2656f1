//! Keyed cache of query results.
//!
//! This module is resource-agnostic:
//! - Entries are keyed by structural [`QueryKey`]s and hold JSON payloads
//! - Writes go through [`EntryPatch`] and bump a per-entry version
//! - Unreferenced entries are evicted after a grace period
//! - Optimistic edits are recorded per field so they can be rolled back

mod entry;
mod key;
mod optimistic;
mod store;

pub use entry::{CacheEntry, EntryPatch, QueryStatus};
pub use key::{KeyMatcher, KeyPart, QueryKey};
pub use optimistic::{MutationId, OptimisticLedger, OptimisticPatch, PatchOp, UpdateFn};
pub use store::CacheStore;
