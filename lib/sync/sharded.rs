use std::hash::{Hash as _, Hasher as _};

use async_trait::async_trait;
use futures::future::join_all;
use rustc_hash::FxHasher;

use super::{FetchCoordinator, Synchronizer, TaskFactory};
use crate::error::FetchError;
use crate::path::PathKey;

/// Spreads path keys over several independent [`FetchCoordinator`]s.
///
/// A key always maps to the same shard, so the at-most-one-fetch-per-key guarantee is kept while
/// the pending maps and worker pools are split.
#[derive(Debug)]
pub struct ShardedSynchronizer {
    shards: Vec<FetchCoordinator>,
}

impl ShardedSynchronizer {
    /// Create `shards` coordinators with `workers` pool slots each.
    #[must_use]
    pub fn new(shards: usize, workers: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| FetchCoordinator::new(workers))
                .collect(),
        }
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "only the low bits pick the shard"
    )]
    fn shard_for(&self, key: &PathKey) -> &FetchCoordinator {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[async_trait]
impl Synchronizer for ShardedSynchronizer {
    async fn execute(&self, key: PathKey, factory: TaskFactory) -> Result<(), FetchError> {
        self.shard_for(&key).execute(key, factory).await
    }

    async fn shutdown(&self) {
        join_all(self.shards.iter().map(FetchCoordinator::shutdown)).await;
    }

    fn pending(&self) -> usize {
        self.shards.iter().map(FetchCoordinator::pending).sum()
    }
}
