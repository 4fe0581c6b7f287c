use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use super::{AttributeView, EntryFilter, FileAttr, LocalStore, OpenFlags};
use crate::io;

/// Why a directory cannot host a store.
#[derive(Debug, Error)]
pub enum InvalidRootPathError {
    /// The path exists and is not a directory.
    #[error("Root path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The directory holds files this program did not put there.
    #[error("Root path appears to contain data not managed by this app: {0}")]
    ForeignContent(PathBuf),

    /// Inspecting or preparing the root failed.
    #[error("IO error while accessing root path: {0}")]
    Io(#[from] std::io::Error),
}

/// A [`LocalStore`] keeping its content in a directory on the host filesystem.
///
/// Store path `/a/b` lives at `<root>/a/b`.
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
    temporary: bool,
    expire_after: Option<Duration>,
}

impl DirStore {
    // Dangerous: changing this constant makes existing store directories look foreign, and they
    // will be refused on the next start.
    const MARKER_FILE: &'static str = ".overlay_fs";

    /// Open (or create) a persistent store at `root`.
    ///
    /// If the path exists, it must either be an empty directory, or a directory which was
    /// previously used as a store by this program. Existing content is kept.
    pub async fn open(root: &Path) -> Result<Self, InvalidRootPathError> {
        Self::open_with(root, false).await
    }

    /// Open a store whose content is cleared when it is closed.
    pub async fn temporary(root: &Path) -> Result<Self, InvalidRootPathError> {
        Self::open_with(root, true).await
    }

    async fn open_with(root: &Path, temporary: bool) -> Result<Self, InvalidRootPathError> {
        let mut pbuf = match tokio::fs::canonicalize(root).await {
            Ok(mut p) => {
                if !tokio::fs::metadata(&p).await?.is_dir() {
                    return Err(InvalidRootPathError::NotADirectory(p));
                }

                let mut entries = tokio::fs::read_dir(&p).await?;
                let is_empty = entries.next_entry().await?.is_none();

                p.push(Self::MARKER_FILE);
                let marker_exists = tokio::fs::try_exists(&p).await?;
                p.pop();

                if !(is_empty || marker_exists) {
                    return Err(InvalidRootPathError::ForeignContent(p));
                }
                p
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(root).await?;
                tokio::fs::canonicalize(root).await?
            }
            Err(e) => return Err(e.into()),
        };

        pbuf.push(Self::MARKER_FILE);
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&pbuf)
            .await?;
        pbuf.pop();

        // Nothing can be writing into the root yet, so any partial file is an orphan.
        let orphans = io::remove_partials(&pbuf).await?;
        if orphans > 0 {
            debug!(orphans, "removed leftover partial files");
        }

        debug!(root = %pbuf.display(), temporary, "opened local store");
        Ok(Self {
            root: pbuf,
            temporary,
            expire_after: None,
        })
    }

    /// Make [`LocalStore::expire`] remove files not modified within `max_age`.
    #[must_use]
    pub fn with_expire_after(mut self, max_age: Duration) -> Self {
        self.expire_after = Some(max_age);
        self
    }

    /// Map a store path onto the host filesystem.
    fn resolve(&self, path: &str) -> std::io::Result<PathBuf> {
        let mut resolved = self.root.clone();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("path escapes the store root: {path}"),
                    ));
                }
                seg => resolved.push(seg),
            }
        }
        Ok(resolved)
    }

    fn is_hidden_entry(name: &str) -> bool {
        name == Self::MARKER_FILE || io::is_partial_name(name)
    }

    /// Remove every file whose modification time is older than the configured age.
    ///
    /// Partial files left behind by interrupted writes count as files here and are reclaimed
    /// once they are old enough. Returns the number of files removed. A store without an expiry
    /// age removes nothing.
    pub async fn expire_stale(&self) -> std::io::Result<usize> {
        let Some(max_age) = self.expire_after else {
            return Ok(0);
        };
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Ok(0);
        };

        let mut removed = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name() == Self::MARKER_FILE {
                    continue;
                }
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.modified()? < cutoff {
                    tokio::fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl LocalStore for DirStore {
    fn base_directory(&self) -> &Path {
        &self.root
    }

    fn is_temporary(&self) -> bool {
        self.temporary
    }

    async fn exists(&self, path: &str) -> std::io::Result<bool> {
        tokio::fs::try_exists(self.resolve(path)?).await
    }

    async fn open_read(&self, path: &str) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.resolve(path)?).await
    }

    async fn open_write(&self, path: &str, flags: OpenFlags) -> std::io::Result<tokio::fs::File> {
        let target = self.resolve(path)?;
        (flags | OpenFlags::WRITE)
            .difference(OpenFlags::READ)
            .to_open_options()
            .open(target)
            .await
    }

    async fn open_channel(
        &self,
        path: &str,
        flags: OpenFlags,
    ) -> std::io::Result<tokio::fs::File> {
        let target = self.resolve(path)?;
        (flags | OpenFlags::READ).to_open_options().open(target).await
    }

    async fn create_directory(&self, path: &str) -> std::io::Result<()> {
        tokio::fs::create_dir(self.resolve(path)?).await
    }

    async fn delete(&self, path: &str, must_exist: bool) -> std::io::Result<()> {
        let target = self.resolve(path)?;
        let result = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !must_exist => Ok(()),
            other => other,
        }
    }

    async fn copy_file(&self, src: &str, dest: &str, replace: bool) -> std::io::Result<()> {
        let from = self.resolve(src)?;
        let to = self.resolve(dest)?;
        if !replace && tokio::fs::try_exists(&to).await? {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("copy target exists: {dest}"),
            ));
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(from, to).await.map(|_| ())
    }

    async fn attributes(&self, path: &str) -> std::io::Result<FileAttr> {
        tokio::fs::metadata(self.resolve(path)?)
            .await
            .map(FileAttr::from)
    }

    fn attribute_view(&self, path: &str) -> std::io::Result<AttributeView> {
        Ok(AttributeView::new(self.resolve(path)?))
    }

    async fn list_directory(
        &self,
        path: &str,
        filter: EntryFilter<'_>,
    ) -> std::io::Result<Vec<String>> {
        let dir = self.resolve(path)?;
        let prefix = path.trim_end_matches('/');

        let mut listed = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(entry = ?entry.path(), "skipping entry with a non UTF-8 name");
                continue;
            };
            if Self::is_hidden_entry(&name) {
                continue;
            }
            let full = format!("{prefix}/{name}");
            if filter(&full) {
                listed.push(full);
            }
        }
        listed.sort_unstable();
        Ok(listed)
    }

    async fn read_all(&self, path: &str) -> std::io::Result<Bytes> {
        tokio::fs::read(self.resolve(path)?).await.map(Bytes::from)
    }

    async fn stage(&self, path: &str, data: Bytes) -> std::io::Result<()> {
        io::write_staged(&self.resolve(path)?, &data).await
    }

    async fn expire(&self) {
        match self.expire_stale().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "expired stale store entries"),
            Err(e) => warn!(error = %e, "failed to expire stale store entries"),
        }
    }

    async fn close(&self) -> std::io::Result<()> {
        if self.temporary {
            debug!(root = %self.root.display(), "clearing temporary store");
            io::remove_dir_contents(&self.root).await?;
        }
        Ok(())
    }
}
