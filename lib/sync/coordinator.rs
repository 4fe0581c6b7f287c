//! Single-flight fetch execution.
//!
//! Given a path key and a fetch task, ensures at most one task runs per key at any instant.
//! Callers that arrive while a fetch for their key is in flight join it through a [`Shared`]
//! future and receive the very same outcome as the caller that started it.
//!
//! Tasks run on a bounded pool: spawned tokio tasks gated by a semaphore. Completion is decoupled
//! from callers; a fetch keeps running even if every caller stops waiting for it, and it removes
//! its own pending entry when it ends.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument as _, debug, debug_span, instrument, warn};

use crate::error::FetchError;
use crate::path::PathKey;

type FetchOutcome = Result<(), FetchError>;
type SharedOutcome = Shared<BoxFuture<'static, FetchOutcome>>;

#[derive(Debug, Error)]
#[error("fetch task panicked")]
struct TaskPanicked;

/// A fetch that has been started and not yet finished.
struct PendingFetch {
    /// Distinguishes successive fetches of the same key.
    id: u64,
    outcome: SharedOutcome,
}

struct Inner {
    pending: scc::HashMap<PathKey, PendingFetch>,
    permits: Semaphore,
    shutdown: CancellationToken,
    workers: TaskTracker,
    next_id: AtomicU64,
}

/// Coalesces concurrent fetches of the same path key.
///
/// Cloning yields another handle to the same coordinator.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("pending", &self.inner.pending.len())
            .field("available_workers", &self.inner.permits.available_permits())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl FetchCoordinator {
    /// Create a coordinator running at most `workers` fetch tasks at once.
    ///
    /// A pool of zero workers is bumped to one.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: scc::HashMap::new(),
                permits: Semaphore::new(workers.max(1)),
                shutdown: CancellationToken::new(),
                workers: TaskTracker::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Run the task produced by `factory` for `key`, unless one is already in flight.
    ///
    /// If no fetch for `key` is pending, `factory` is invoked and its task is submitted to the
    /// worker pool; otherwise `factory` is never called and this caller joins the pending fetch.
    /// Either way the call returns once that single fetch has ended, with its outcome.
    ///
    /// After [`shutdown`](Self::shutdown), nothing is submitted and the call fails with
    /// [`FetchError::NotFound`].
    #[instrument(name = "FetchCoordinator::execute", skip(self, key, factory), fields(%key))]
    pub async fn execute<F, Fut>(&self, key: PathKey, factory: F) -> Result<(), FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), FetchError>> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            debug!("coordinator is shut down, refusing fetch");
            return Err(FetchError::not_found(key.as_str()));
        }

        let outcome = match self.inner.pending.entry_async(key.clone()).await {
            scc::hash_map::Entry::Occupied(occ) => {
                debug!("joining in-flight fetch");
                occ.get().outcome.clone()
            }
            scc::hash_map::Entry::Vacant(vac) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                // A dropped sender means the worker was torn down with the runtime.
                let outcome = async move { rx.await.unwrap_or(Err(FetchError::Interrupted)) }
                    .boxed()
                    .shared();
                vac.insert_entry(PendingFetch {
                    id,
                    outcome: outcome.clone(),
                });
                self.submit(key, id, factory(), tx);
                outcome
            }
        };

        outcome.await
    }

    /// Hand a task to the worker pool. The worker owns the pending entry from here on.
    fn submit<Fut>(&self, key: PathKey, id: u64, task: Fut, tx: oneshot::Sender<FetchOutcome>)
    where
        Fut: Future<Output = FetchOutcome> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let span = debug_span!("fetch", %key, id);
        self.inner.workers.spawn(
            async move {
                let outcome = tokio::select! {
                    biased;
                    () = inner.shutdown.cancelled() => Err(FetchError::Interrupted),
                    res = Self::run(&inner.permits, task) => res,
                };

                // Remove before publishing, so anyone who observes the outcome and tries again
                // starts a fresh fetch instead of joining this finished one.
                drop(
                    inner
                        .pending
                        .remove_if_async(&key, |pending| pending.id == id)
                        .await,
                );

                match &outcome {
                    Ok(()) => debug!("fetch finished"),
                    Err(e) => debug!(error = %e, "fetch failed"),
                }
                drop(tx.send(outcome));
            }
            .instrument(span),
        );
    }

    async fn run<Fut>(permits: &Semaphore, task: Fut) -> FetchOutcome
    where
        Fut: Future<Output = FetchOutcome> + Send,
    {
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| FetchError::Interrupted)?;
        AssertUnwindSafe(task)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!("fetch task panicked");
                Err(FetchError::wrapped(TaskPanicked))
            })
    }

    /// Stop the worker pool and release every waiter.
    ///
    /// Queued tasks never start, running tasks are dropped at their next suspension point, and
    /// every caller blocked in [`execute`](Self::execute) returns [`FetchError::Interrupted`].
    /// Returns once all workers have exited, so no waiter is still blocked afterwards.
    pub async fn shutdown(&self) {
        debug!(pending = self.pending(), "shutting down fetch coordinator");
        self.inner.shutdown.cancel();
        self.inner.permits.close();
        self.inner.workers.close();
        self.inner.workers.wait().await;
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of fetches currently in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }
}
