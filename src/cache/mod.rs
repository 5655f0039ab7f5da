//! Keyed cache of remote query results.
//!
//! This module provides a transport-agnostic caching mechanism that:
//! - Holds the latest known value per structural [`QueryKey`]
//! - Notifies subscribers synchronously on every write
//! - Serves stale data while background refetches reconcile it
//! - Evicts entries nobody has subscribed to for a configurable TTL

mod entry;
pub mod gc;
mod key;
mod observer;
mod store;
mod subscription;

pub use entry::{CacheEntry, CacheSource, EntryState, FetchOutcome};
pub use key::{KeyPart, QueryKey};
pub use observer::{QueryObserver, QueryState};
pub use store::{CacheStore, QueryFn, StoreConfig};
pub use subscription::Subscription;
pub(crate) use store::PendingMutation;
