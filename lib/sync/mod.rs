//! Coordination primitives used to coalesce fetches.
//!
//! A [`Synchronizer`] owns whatever primitive guarantees that a path key is fetched at most once
//! at a time. The default is a single [`FetchCoordinator`] per overlay;
//! [`ShardedSynchronizer`] spreads keys over several coordinators, each with its own pool.

/// Single-flight fetch coordinator.
pub mod coordinator;
/// Key-sharded synchronizer.
pub mod sharded;

pub use coordinator::FetchCoordinator;
pub use sharded::ShardedSynchronizer;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::FetchError;
use crate::path::PathKey;

/// A boxed fetch task, as accepted by a [`Synchronizer`].
pub type FetchTask = BoxFuture<'static, Result<(), FetchError>>;

/// Produces the fetch task for a key; only invoked if no fetch for the key is in flight.
pub type TaskFactory = Box<dyn FnOnce() -> FetchTask + Send>;

/// Supplies the coordination primitive for an overlay.
#[async_trait]
pub trait Synchronizer: Send + Sync + 'static {
    /// Run the task from `factory` for `key`, or join the fetch already in flight for it.
    async fn execute(&self, key: PathKey, factory: TaskFactory) -> Result<(), FetchError>;

    /// Stop all fetch execution and release every waiter.
    async fn shutdown(&self);

    /// Number of fetches currently in flight.
    fn pending(&self) -> usize;
}

#[async_trait]
impl Synchronizer for FetchCoordinator {
    async fn execute(&self, key: PathKey, factory: TaskFactory) -> Result<(), FetchError> {
        Self::execute(self, key, factory).await
    }

    async fn shutdown(&self) {
        Self::shutdown(self).await;
    }

    fn pending(&self) -> usize {
        Self::pending(self)
    }
}

/// Build the synchronizer for an overlay: one coordinator, or `shards` of them.
///
/// `workers` bounds the fetch pool of each coordinator.
#[must_use]
pub fn create(workers: usize, shards: usize) -> Arc<dyn Synchronizer> {
    if shards > 1 {
        Arc::new(ShardedSynchronizer::new(shards, workers))
    } else {
        Arc::new(FetchCoordinator::new(workers))
    }
}
