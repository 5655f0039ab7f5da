//! Optimistic mutations over a [`CacheStore`](crate::cache::CacheStore).
//!
//! The coordinator snapshots the cached value, applies a local patch, runs
//! the remote call, then commits or rolls back. A [`ReconcilePolicy`]
//! decides whether the settled value is refetched from the source.

mod cancel;
mod coordinator;
mod policy;
mod record;

pub use cancel::CancelToken;
pub use coordinator::{CancelBehavior, Mutation, MutationCoordinator};
pub use policy::{AlwaysRefetch, ReconcilePolicy, Reconciliation, Settlement, TrustOnCommit};
pub use record::{MutationRecord, MutationStatus, Patch};
