//! The overlay: a local store that pulls missing objects from a remote on first access.
//!
//! Read-path operations ([`Overlay::exists`], [`Overlay::open_for_read`], [`Overlay::copy_file`])
//! consult the local store first and fall back to [`Overlay::retrieve`], which hands the fetch to
//! the binding's [`Synchronizer`](crate::sync::Synchronizer) so that concurrent callers for one
//! path share a single remote fetch. Everything else is passed straight through.
//!
//! A path the remote does not have is reported as absent: `exists` returns `false` and
//! `open_for_read` fails with [`std::io::ErrorKind::NotFound`]. Every other retrieval failure is
//! an error.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt as _;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use crate::backend::{BackendBinding, Sender};
use crate::error::FetchError;
use crate::path::PathKey;
use crate::store::{AttributeView, EntryFilter, FileAttr, LocalStore, OpenFlags};

/// When a closed [`WriteHandle`] pushes its content to the remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPolicy {
    /// `close` returns after the send finished and reports its failure.
    #[default]
    Sync,
    /// `close` returns once the file is synced; the send runs in the background and failures are
    /// only logged.
    Background,
}

/// A local store with on-demand remote retrieval.
///
/// Cloning yields another handle onto the same binding.
#[derive(Clone)]
pub struct Overlay {
    binding: BackendBinding,
    policy: SendPolicy,
    sends: TaskTracker,
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("base_directory", &self.binding.store.base_directory())
            .field("policy", &self.policy)
            .field("pending", &self.binding.synchronizer.pending())
            .finish_non_exhaustive()
    }
}

impl Overlay {
    /// Wrap a binding. Written files are sent according to `policy`.
    #[must_use]
    pub fn new(binding: BackendBinding, policy: SendPolicy) -> Self {
        Self {
            binding,
            policy,
            sends: TaskTracker::new(),
        }
    }

    /// The wrapped local store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.binding.store
    }

    /// Number of retrievals currently in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.binding.synchronizer.pending()
    }

    /// Pull `path` from the remote into the local store.
    ///
    /// The empty path and the root are never fetchable and fail with [`FetchError::NotFound`]
    /// before any retriever is consulted. Concurrent calls for the same path share one fetch and
    /// all observe its outcome.
    #[instrument(name = "Overlay::retrieve", skip(self))]
    pub async fn retrieve(&self, path: &str) -> Result<(), FetchError> {
        let key = PathKey::new(path)?;
        let retriever = Arc::clone(&self.binding.retriever);
        let task_key = key.clone();
        self.binding
            .synchronizer
            .execute(
                key,
                Box::new(move || async move { retriever.retrieve(&task_key).await }.boxed()),
            )
            .await
    }

    /// Whether `path` exists locally, retrieving it first if it does not.
    ///
    /// Returns `false` when the remote lacks the object. Transport failures, shutdown
    /// interruptions and any other retrieval failure are returned as errors.
    #[instrument(name = "Overlay::exists", skip(self))]
    pub async fn exists(&self, path: &str) -> io::Result<bool> {
        if self.binding.store.exists(path).await? {
            return Ok(true);
        }

        match self.retrieve(path).await {
            Ok(()) => self.binding.store.exists(path).await,
            Err(e) if e.is_not_found() => {
                debug!("remote does not have the path");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open `path` for reading, retrieving it once if the local store reports it missing.
    ///
    /// Local failures other than "not found" are returned without a retrieval.
    #[instrument(name = "Overlay::open_for_read", skip(self))]
    pub async fn open_for_read(&self, path: &str) -> io::Result<File> {
        match self.binding.store.open_read(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("local miss, retrieving");
                self.retrieve(path).await?;
                self.binding.store.open_read(path).await
            }
            other => other,
        }
    }

    /// Copy `src` to `dest`, materializing `src` first.
    #[instrument(name = "Overlay::copy_file", skip(self))]
    pub async fn copy_file(&self, src: &str, dest: &str, replace: bool) -> io::Result<()> {
        // Never let the local copy read a path that is still being fetched.
        let present = self.exists(src).await?;
        debug!(present, "source checked");
        self.binding.store.copy_file(src, dest, replace).await
    }

    /// Open `path` for writing. The content is sent to the remote when the handle is closed.
    #[instrument(name = "Overlay::open_for_write", skip(self))]
    pub async fn open_for_write(&self, path: &str, flags: OpenFlags) -> io::Result<WriteHandle> {
        let key = PathKey::new(path)?;
        let file = self.binding.store.open_write(path, flags).await?;
        Ok(WriteHandle {
            file,
            key,
            sender: Arc::clone(&self.binding.sender),
            policy: self.policy,
            sends: self.sends.clone(),
        })
    }

    /// Push the local content of `path` to the remote now.
    #[instrument(name = "Overlay::send", skip(self))]
    pub async fn send(&self, path: &str) -> io::Result<()> {
        let key = PathKey::new(path)?;
        self.binding.sender.send(&key).await.map_err(Into::into)
    }

    /// Open a read/write channel. Nothing is retrieved and nothing is sent.
    pub async fn open_channel(&self, path: &str, flags: OpenFlags) -> io::Result<File> {
        self.binding.store.open_channel(path, flags).await
    }

    /// Create a single directory in the local store.
    pub async fn create_directory(&self, path: &str) -> io::Result<()> {
        self.binding.store.create_directory(path).await
    }

    /// Delete a local file or empty directory. The remote copy is left alone.
    pub async fn delete(&self, path: &str, must_exist: bool) -> io::Result<()> {
        self.binding.store.delete(path, must_exist).await
    }

    /// Attributes of the local entry.
    pub async fn attributes(&self, path: &str) -> io::Result<FileAttr> {
        self.binding.store.attributes(path).await
    }

    /// A mutable view on the local entry's attributes.
    pub fn attribute_view(&self, path: &str) -> io::Result<AttributeView> {
        self.binding.store.attribute_view(path)
    }

    /// List the local directory `path`, keeping entries `filter` accepts.
    pub async fn list_directory(
        &self,
        path: &str,
        filter: EntryFilter<'_>,
    ) -> io::Result<Vec<String>> {
        self.binding.store.list_directory(path, filter).await
    }

    /// Run the store's expiry hook.
    pub async fn expire(&self) {
        self.binding.store.expire().await;
    }

    /// Root of the local store on the host.
    #[must_use]
    pub fn base_directory(&self) -> &Path {
        self.binding.store.base_directory()
    }

    /// Whether the store is wiped on close.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.binding.store.is_temporary()
    }

    /// Shut the overlay down.
    ///
    /// Waits for background sends, then stops the synchronizer (interrupting in-flight
    /// retrievals and releasing every waiter) and only then closes the local store.
    #[instrument(name = "Overlay::close", skip(self))]
    pub async fn close(&self) -> io::Result<()> {
        self.sends.close();
        self.sends.wait().await;
        self.binding.synchronizer.shutdown().await;
        self.binding.store.close().await
    }
}

/// A file opened through [`Overlay::open_for_write`].
///
/// Writes go to the local store. [`close`](Self::close) finalizes the file and sends it to the
/// remote; dropping the handle without closing it sends nothing.
pub struct WriteHandle {
    file: File,
    key: PathKey,
    sender: Arc<dyn Sender>,
    policy: SendPolicy,
    sends: TaskTracker,
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl WriteHandle {
    /// The path this handle writes.
    #[must_use]
    pub fn key(&self) -> &PathKey {
        &self.key
    }

    /// Flush and sync the file, then send it according to the overlay's [`SendPolicy`].
    ///
    /// Once the overlay is closed, background sends can no longer be tracked and the send runs
    /// inline instead, so its failure is returned.
    #[instrument(name = "WriteHandle::close", skip(self), fields(key = %self.key))]
    pub async fn close(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        match self.policy {
            SendPolicy::Background if self.sends.is_closed() => {
                debug!("overlay closed, sending inline");
                self.sender.send(&self.key).await.map_err(Into::into)
            }
            SendPolicy::Sync => self.sender.send(&self.key).await.map_err(Into::into),
            SendPolicy::Background => {
                let (sender, key) = (self.sender, self.key);
                self.sends.spawn(async move {
                    if let Err(e) = sender.send(&key).await {
                        warn!(%key, error = %e, "background send failed");
                    }
                });
                Ok(())
            }
        }
    }
}

impl AsyncWrite for WriteHandle {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}
