use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{BackendContext, BackendError, Protocol, Retriever, Sender};
use crate::error::FetchError;
use crate::io;
use crate::path::PathKey;
use crate::store::LocalStore;

/// A "remote" that is another directory on the host.
///
/// Env keys: `root` (required), the directory holding the remote objects.
pub struct MirrorRemote {
    root: PathBuf,
    store: Arc<dyn LocalStore>,
}

impl MirrorRemote {
    /// Mirror the directory `root` into `store`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn LocalStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    fn remote_path(&self, key: &PathKey) -> PathBuf {
        self.root.join(key.relative())
    }
}

#[async_trait]
impl Retriever for MirrorRemote {
    async fn retrieve(&self, key: &PathKey) -> Result<(), FetchError> {
        let source = self.remote_path(key);
        let data = match tokio::fs::read(&source).await {
            Ok(buf) => Bytes::from(buf),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::not_found(key));
            }
            Err(e) => return Err(e.into()),
        };
        debug!(%key, bytes = data.len(), "copying from mirror");
        self.store.stage(key.as_str(), data).await?;
        Ok(())
    }
}

#[async_trait]
impl Sender for MirrorRemote {
    async fn send(&self, key: &PathKey) -> Result<(), FetchError> {
        let data = self.store.read_all(key.as_str()).await?;
        debug!(%key, bytes = data.len(), "copying to mirror");
        io::write_staged(&self.remote_path(key), &data).await?;
        Ok(())
    }
}

/// Factory registered as `mirror`.
pub async fn create(ctx: BackendContext) -> Result<Protocol, BackendError> {
    let root = ctx.env.require("root")?;
    Ok(Protocol::symmetric(Arc::new(MirrorRemote::new(
        root, ctx.store,
    ))))
}
