//! Synchronous access to an [`Overlay`] from threads outside the tokio runtime.
//!
//! Every call blocks the current thread on the runtime handle the facade was built with. Calling
//! into it from a runtime worker thread panics, exactly like [`tokio::runtime::Handle::block_on`].

use std::io;
use std::path::Path;

use tokio::io::AsyncWriteExt as _;
use tokio::runtime::Handle;

use crate::error::FetchError;
use crate::overlay::{Overlay, WriteHandle};
use crate::store::{AttributeView, EntryFilter, FileAttr, OpenFlags};

/// Blocking wrapper around an [`Overlay`].
#[derive(Debug, Clone)]
pub struct BlockingOverlay {
    overlay: Overlay,
    runtime: Handle,
}

impl BlockingOverlay {
    /// Drive `overlay` on `runtime`.
    #[must_use]
    pub fn new(overlay: Overlay, runtime: Handle) -> Self {
        Self { overlay, runtime }
    }

    /// The async overlay underneath.
    #[must_use]
    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// See [`Overlay::exists`].
    pub fn exists(&self, path: &str) -> io::Result<bool> {
        self.runtime.block_on(self.overlay.exists(path))
    }

    /// See [`Overlay::retrieve`].
    pub fn retrieve(&self, path: &str) -> Result<(), FetchError> {
        self.runtime.block_on(self.overlay.retrieve(path))
    }

    /// Open for reading, retrieving on a local miss. The returned file is a plain std file.
    pub fn open_for_read(&self, path: &str) -> io::Result<std::fs::File> {
        self.runtime.block_on(async {
            let file = self.overlay.open_for_read(path).await?;
            Ok(file.into_std().await)
        })
    }

    /// See [`Overlay::open_for_write`]. Close the handle to send.
    pub fn open_for_write(&self, path: &str, flags: OpenFlags) -> io::Result<BlockingWriteHandle> {
        let inner = self
            .runtime
            .block_on(self.overlay.open_for_write(path, flags))?;
        Ok(BlockingWriteHandle {
            inner,
            runtime: self.runtime.clone(),
        })
    }

    /// See [`Overlay::copy_file`].
    pub fn copy_file(&self, src: &str, dest: &str, replace: bool) -> io::Result<()> {
        self.runtime
            .block_on(self.overlay.copy_file(src, dest, replace))
    }

    /// See [`Overlay::send`].
    pub fn send(&self, path: &str) -> io::Result<()> {
        self.runtime.block_on(self.overlay.send(path))
    }

    /// See [`Overlay::create_directory`].
    pub fn create_directory(&self, path: &str) -> io::Result<()> {
        self.runtime.block_on(self.overlay.create_directory(path))
    }

    /// See [`Overlay::delete`].
    pub fn delete(&self, path: &str, must_exist: bool) -> io::Result<()> {
        self.runtime.block_on(self.overlay.delete(path, must_exist))
    }

    /// See [`Overlay::open_channel`]. The returned file is a plain std file.
    pub fn open_channel(&self, path: &str, flags: OpenFlags) -> io::Result<std::fs::File> {
        self.runtime.block_on(async {
            let file = self.overlay.open_channel(path, flags).await?;
            Ok(file.into_std().await)
        })
    }

    /// See [`Overlay::attributes`].
    pub fn attributes(&self, path: &str) -> io::Result<FileAttr> {
        self.runtime.block_on(self.overlay.attributes(path))
    }

    /// See [`Overlay::attribute_view`].
    pub fn attribute_view(&self, path: &str) -> io::Result<AttributeView> {
        self.overlay.attribute_view(path)
    }

    /// See [`Overlay::list_directory`].
    pub fn list_directory(&self, path: &str, filter: EntryFilter<'_>) -> io::Result<Vec<String>> {
        self.runtime
            .block_on(self.overlay.list_directory(path, filter))
    }

    /// See [`Overlay::expire`].
    pub fn expire(&self) {
        self.runtime.block_on(self.overlay.expire());
    }

    /// See [`Overlay::base_directory`].
    #[must_use]
    pub fn base_directory(&self) -> &Path {
        self.overlay.base_directory()
    }

    /// See [`Overlay::is_temporary`].
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.overlay.is_temporary()
    }

    /// See [`Overlay::close`].
    pub fn close(&self) -> io::Result<()> {
        self.runtime.block_on(self.overlay.close())
    }
}

/// Blocking counterpart of [`WriteHandle`].
#[derive(Debug)]
pub struct BlockingWriteHandle {
    inner: WriteHandle,
    runtime: Handle,
}

impl BlockingWriteHandle {
    /// Finalize the file and send it. See [`WriteHandle::close`].
    pub fn close(self) -> io::Result<()> {
        self.runtime.block_on(self.inner.close())
    }
}

impl io::Write for BlockingWriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.runtime.block_on(self.inner.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.runtime.block_on(self.inner.flush())
    }
}
