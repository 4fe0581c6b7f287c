//! The local store contract the overlay wraps.
//!
//! A [`LocalStore`] holds materialized copies of remote objects. It knows nothing about remotes;
//! the [`Overlay`](crate::overlay::Overlay) decides when to pull objects into it.

/// Directory-backed local store.
pub mod dir;

pub use dir::{DirStore, InvalidRootPathError};

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// How a file should be opened for writing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u8 {
        /// Open for reading as well.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Append on each write.
        const APPEND = 1 << 2;
        /// Truncate to zero length.
        const TRUNCATE = 1 << 3;
        /// Create the file if it does not exist.
        const CREATE = 1 << 4;
        /// Fail if the file already exists.
        const CREATE_NEW = 1 << 5;

        /// The usual "replace the file" mode.
        const OVERWRITE = Self::WRITE.bits() | Self::CREATE.bits() | Self::TRUNCATE.bits();
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::OVERWRITE
    }
}

impl OpenFlags {
    /// Translate into tokio open options.
    #[must_use]
    pub fn to_open_options(self) -> tokio::fs::OpenOptions {
        let mut opts = tokio::fs::OpenOptions::new();
        opts.read(self.contains(Self::READ))
            .write(self.intersects(Self::WRITE | Self::APPEND))
            .append(self.contains(Self::APPEND))
            .truncate(self.contains(Self::TRUNCATE))
            .create(self.contains(Self::CREATE))
            .create_new(self.contains(Self::CREATE_NEW));
        opts
    }
}

bitflags! {
    /// Unix permission bits of a stored entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// Others may execute.
        const OTHER_EXECUTE = 1 << 0;
        /// Others may write.
        const OTHER_WRITE   = 1 << 1;
        /// Others may read.
        const OTHER_READ    = 1 << 2;

        /// Group may execute.
        const GROUP_EXECUTE = 1 << 3;
        /// Group may write.
        const GROUP_WRITE   = 1 << 4;
        /// Group may read.
        const GROUP_READ    = 1 << 5;

        /// Owner may execute.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner may write.
        const OWNER_WRITE   = 1 << 7;
        /// Owner may read.
        const OWNER_READ    = 1 << 8;
    }
}

/// The type of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// Anything else (devices, sockets, pipes).
    Other,
}

/// Basic attributes of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileAttr {
    /// File, directory, link or other.
    pub kind: EntryKind,
    /// Length in bytes.
    pub size: u64,
    /// Last modification.
    pub modified: SystemTime,
    /// Last access.
    pub accessed: SystemTime,
    /// Not every platform records creation time.
    pub created: Option<SystemTime>,
    /// Mode bits.
    pub permissions: Permissions,
}

impl From<std::fs::Metadata> for FileAttr {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "permission bits fit in the low 12 bits of the mode"
    )]
    fn from(meta: std::fs::Metadata) -> Self {
        use std::os::unix::fs::PermissionsExt as _;

        let ft = meta.file_type();
        let kind = if ft.is_file() {
            EntryKind::File
        } else if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Other
        };

        Self {
            kind,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            accessed: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            created: meta.created().ok(),
            permissions: Permissions::from_bits_truncate(meta.permissions().mode() as u16),
        }
    }
}

/// A handle for reading and updating the attributes of one stored entry.
///
/// Obtaining a view performs no I/O; the entry may not exist yet.
#[derive(Debug, Clone)]
pub struct AttributeView {
    path: PathBuf,
}

impl AttributeView {
    /// Create a view over the entry at `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the current attributes.
    pub async fn read(&self) -> std::io::Result<FileAttr> {
        tokio::fs::metadata(&self.path).await.map(FileAttr::from)
    }

    /// Set the modification time.
    pub async fn set_modified(&self, time: SystemTime) -> std::io::Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(path)?
                .set_modified(time)
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

/// Predicate applied to store paths by [`LocalStore::list_directory`].
pub type EntryFilter<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Capability set of the local store.
///
/// Paths are `/`-rooted store paths such as `/a/b.txt`. A missing path must surface as
/// [`std::io::ErrorKind::NotFound`]; the overlay's retry-on-miss logic keys off that kind.
#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    /// The directory this store keeps its content in.
    fn base_directory(&self) -> &Path;

    /// Whether the store discards its content on close.
    fn is_temporary(&self) -> bool;

    /// Whether `path` exists locally.
    async fn exists(&self, path: &str) -> std::io::Result<bool>;

    /// Open an existing file for reading.
    async fn open_read(&self, path: &str) -> std::io::Result<tokio::fs::File>;

    /// Open a file for writing with `flags`. Parent directories must exist.
    async fn open_write(&self, path: &str, flags: OpenFlags) -> std::io::Result<tokio::fs::File>;

    /// Open a seekable read/write channel.
    async fn open_channel(&self, path: &str, flags: OpenFlags)
    -> std::io::Result<tokio::fs::File>;

    /// Create one directory; its parent must exist.
    async fn create_directory(&self, path: &str) -> std::io::Result<()>;

    /// Delete a file or empty directory. Missing paths are an error only if `must_exist`.
    async fn delete(&self, path: &str, must_exist: bool) -> std::io::Result<()>;

    /// Copy `src` to `dest`. Fails with `AlreadyExists` if `dest` exists and `replace` is false.
    async fn copy_file(&self, src: &str, dest: &str, replace: bool) -> std::io::Result<()>;

    /// Attributes of an entry.
    async fn attributes(&self, path: &str) -> std::io::Result<FileAttr>;

    /// A handle for reading and updating the attributes of an entry.
    fn attribute_view(&self, path: &str) -> std::io::Result<AttributeView>;

    /// List the entries of a directory accepted by `filter`, as full store paths.
    async fn list_directory(
        &self,
        path: &str,
        filter: EntryFilter<'_>,
    ) -> std::io::Result<Vec<String>>;

    /// Read a whole file.
    async fn read_all(&self, path: &str) -> std::io::Result<Bytes>;

    /// Atomically place `data` at `path`: readers never observe partial content.
    async fn stage(&self, path: &str, data: Bytes) -> std::io::Result<()>;

    /// External expiry hook.
    async fn expire(&self);

    /// Release the store, clearing it if it is temporary.
    async fn close(&self) -> std::io::Result<()>;
}
