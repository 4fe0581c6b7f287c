//! Failure taxonomy for remote retrieval and sending.

use std::sync::Arc;

use thiserror::Error;

type BoxedSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a failed fetch or send.
///
/// The error is cheap to clone so that a single fetch outcome can be handed to every caller that
/// waited on it.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Neither the local store nor the remote backend has the path.
    #[error("not found: {path}")]
    NotFound {
        /// The path that could not be found.
        path: Arc<str>,
    },

    /// Network or protocol failure while talking to the remote side.
    #[error("transport failure for {path}: {source}")]
    Transport {
        /// The path being fetched or sent.
        path: Arc<str>,
        /// The underlying protocol error.
        source: BoxedSource,
    },

    /// The coordinator was shut down while the fetch was pending.
    #[error("fetch interrupted by shutdown")]
    Interrupted,

    /// An I/O failure raised by the fetch task itself.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Any other failure surfacing from a fetch task.
    #[error("fetch task failed: {0}")]
    Wrapped(BoxedSource),
}

impl FetchError {
    /// Build a [`FetchError::NotFound`] for `path`.
    pub fn not_found(path: impl AsRef<str>) -> Self {
        Self::NotFound {
            path: path.as_ref().into(),
        }
    }

    /// Build a [`FetchError::Transport`] for `path` with the given cause.
    pub fn transport<E>(path: impl AsRef<str>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            path: path.as_ref().into(),
            source: Arc::new(source),
        }
    }

    /// Wrap an arbitrary failure.
    pub fn wrapped<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Wrapped(Arc::new(source))
    }

    /// Whether this failure means "the object does not exist".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Transport { .. } | Self::Interrupted | Self::Wrapped(_) => false,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        // An I/O error that already carries a FetchError came from a nested overlay call; unwrap
        // it instead of stacking another layer.
        match e.downcast::<Self>() {
            Ok(fetch) => fetch,
            Err(e) => Self::Io(Arc::new(e)),
        }
    }
}

impl From<FetchError> for std::io::Error {
    fn from(e: FetchError) -> Self {
        use std::io::ErrorKind;

        let kind = match &e {
            FetchError::NotFound { .. } => ErrorKind::NotFound,
            FetchError::Interrupted => ErrorKind::Interrupted,
            FetchError::Io(inner) => inner.kind(),
            FetchError::Transport { .. } | FetchError::Wrapped(_) => ErrorKind::Other,
        };
        Self::new(kind, e)
    }
}
