//! Keyed query cache with optimistic mutations.
//!
//! [`CacheStore`] holds the last known value per [`QueryKey`] and notifies
//! subscribers on every change. [`MutationCoordinator`] patches cached values
//! ahead of a remote call and rolls them back if the call fails. The
//! [`market`] module wires both to a small marketplace backend.

pub mod cache;
pub mod config;
pub mod error;
pub mod market;
pub mod mutation;

pub use cache::{CacheEntry, CacheSource, CacheStore, EntryState, QueryKey, StoreConfig, Subscription};
pub use error::{BoxError, CacheError};
pub use mutation::{AlwaysRefetch, CancelToken, Mutation, MutationCoordinator, ReconcilePolicy, TrustOnCommit};
