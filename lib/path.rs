//! Path keys used to coordinate and deduplicate fetches.

use std::fmt;
use std::sync::Arc;

use crate::error::FetchError;

/// A normalized, `/`-rooted path identifying one fetchable location.
///
/// A `PathKey` is never empty and never denotes the root directory: the root is not something a
/// remote backend can hand us, so constructing a key for it fails with
/// [`FetchError::NotFound`].
///
/// Cloning is cheap; the underlying string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(Arc<str>);

impl PathKey {
    /// Normalize `path` into a key.
    ///
    /// Repeated separators collapse, `.` segments disappear and a trailing `/` is dropped. A `..`
    /// segment is refused outright rather than resolved, so a key can never escape the store root.
    pub fn new(path: &str) -> Result<Self, FetchError> {
        let mut normalized = String::with_capacity(path.len() + 1);
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(FetchError::not_found(path)),
                seg => {
                    normalized.push('/');
                    normalized.push_str(seg);
                }
            }
        }

        if normalized.is_empty() {
            return Err(FetchError::not_found(if path.is_empty() { "/" } else { path }));
        }
        Ok(Self(normalized.into()))
    }

    /// The `/`-rooted form, e.g. `/a/b.txt`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The form without the leading separator, e.g. `a/b.txt`.
    ///
    /// Used for object keys, URL paths and paths under a local root.
    #[must_use]
    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    /// The last path segment.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PathKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for PathKey {
    type Error = FetchError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
