//! Random IO utilities

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt as _;

/// Marker embedded in the names of files that are still being written.
pub const PARTIAL_MARKER: &str = ".partial-";

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Remove all files and directories in the given directory, but not the directory itself.
pub async fn remove_dir_contents(path: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if tokio::fs::metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
    }
    Ok(())
}

/// Whether `name` is the name of an in-progress [`write_staged`] file.
#[must_use]
pub fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(PARTIAL_MARKER)
}

/// Remove every partial file below `root`, returning how many were removed.
///
/// Partial files outlive their writer when the process dies mid-write, or when a write is
/// cancelled while the file is still being created on the blocking pool.
pub async fn remove_partials(root: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                pending.push(entry.path());
            } else if entry.file_name().to_str().is_some_and(is_partial_name) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(removed)
}

/// Removes the partial file on drop unless the write was committed.
struct PartialGuard {
    path: Option<PathBuf>,
}

impl Drop for PartialGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            // Runs on error and on cancellation of the enclosing future, so it cannot await.
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(?path, error = %e, "failed to remove partial file");
                }
            }
        }
    }
}

/// Write `data` to `target` so that readers either see nothing or the complete content.
///
/// The bytes go to a hidden sibling file first, which is synced and then renamed over `target`.
/// If the write fails or the future is dropped midway, the sibling is removed.
pub async fn write_staged(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = target.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("'{}' has no parent directory", target.display()),
        )
    })?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    let partial = parent.join(format!(".{file_name}{PARTIAL_MARKER}{seq}"));

    let mut guard = PartialGuard {
        path: Some(partial.clone()),
    };

    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&partial, target).await?;
    guard.path = None;
    Ok(())
}
