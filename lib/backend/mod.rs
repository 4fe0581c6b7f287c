//! Pluggable remote protocols.
//!
//! A protocol contributes a [`Retriever`] (pull a remote object into the local store) and a
//! [`Sender`] (push a finalized local object to the remote). Protocols are registered by scheme
//! name in a [`BackendRegistry`] and assembled with a local store and a synchronizer into a
//! [`BackendBinding`]. Nothing here reaches into the fetch coordinator.

/// HTTP(S) resources.
pub mod http;
/// A local directory standing in for the remote.
pub mod mirror;
/// S3-compatible object storage.
pub mod s3;

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use secrecy::SecretString;
use thiserror::Error;

use crate::content_type::ContentTypes;
use crate::error::FetchError;
use crate::path::PathKey;
use crate::store::LocalStore;
use crate::sync::Synchronizer;

/// Pulls remote objects into the local store.
#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    /// Materialize `key` in the local store.
    ///
    /// On success the store holds the complete object. Fails with [`FetchError::NotFound`] if
    /// the remote lacks the object and with [`FetchError::Transport`] on protocol errors.
    async fn retrieve(&self, key: &PathKey) -> Result<(), FetchError>;
}

/// Pushes finalized local objects to the remote.
#[async_trait]
pub trait Sender: Send + Sync + 'static {
    /// Upload the local content of `key`.
    async fn send(&self, key: &PathKey) -> Result<(), FetchError>;
}

/// A sender that discards everything, for read-only remotes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSender;

#[async_trait]
impl Sender for NoopSender {
    async fn send(&self, _key: &PathKey) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Failure to assemble a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Nothing is registered under the scheme.
    #[error("no backend registered for scheme '{0}'")]
    UnknownScheme(String),

    /// A required env key is absent.
    #[error("backend configuration is missing '{0}'")]
    MissingKey(String),

    /// An env value could not be parsed.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The backend client could not be built.
    #[error("failed to initialize backend: {0}")]
    Init(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Connection parameters handed to a backend factory.
///
/// Recognized keys are backend specific. Values may hold credentials, so only keys are printed.
#[derive(Clone, Default)]
pub struct BackendEnv {
    values: HashMap<String, String>,
}

impl std::fmt::Debug for BackendEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort_unstable();
        f.debug_struct("BackendEnv").field("keys", &keys).finish()
    }
}

impl BackendEnv {
    /// Wrap a key-value map.
    #[must_use]
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// The raw value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The raw value of `key`, or [`BackendError::MissingKey`].
    pub fn require(&self, key: &str) -> Result<&str, BackendError> {
        self.get(key)
            .ok_or_else(|| BackendError::MissingKey(key.to_owned()))
    }

    /// Parse an optional value.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, BackendError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse().map_err(|e: T::Err| BackendError::InvalidValue {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// An optional duration given in whole seconds.
    pub fn seconds(&self, key: &str) -> Result<Option<Duration>, BackendError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    /// A credential; it is never logged or echoed back.
    #[must_use]
    pub fn secret(&self, key: &str) -> Option<SecretString> {
        self.get(key).map(|v| SecretString::from(v.to_owned()))
    }
}

impl FromIterator<(String, String)> for BackendEnv {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// What a backend factory gets to work with.
#[derive(Clone)]
pub struct BackendContext {
    /// The store retrieved objects are written into and sent objects are read from.
    pub store: Arc<dyn LocalStore>,
    /// Backend-specific connection parameters.
    pub env: BackendEnv,
    /// Media types for objects being sent.
    pub content_types: Arc<ContentTypes>,
}

/// The retrieve/send pair a protocol contributes.
#[derive(Clone)]
pub struct Protocol {
    /// Pulls objects in.
    pub retriever: Arc<dyn Retriever>,
    /// Pushes objects out.
    pub sender: Arc<dyn Sender>,
}

impl Protocol {
    /// Use one value for both roles.
    pub fn symmetric<T>(remote: Arc<T>) -> Self
    where
        T: Retriever + Sender,
    {
        Self {
            retriever: Arc::clone(&remote) as Arc<dyn Retriever>,
            sender: remote,
        }
    }
}

/// The assembled backend of one overlay instance. Immutable once built.
#[derive(Clone)]
pub struct BackendBinding {
    /// Local copies of remote objects.
    pub store: Arc<dyn LocalStore>,
    /// Coalesces retrievals.
    pub synchronizer: Arc<dyn Synchronizer>,
    /// Pulls missing objects.
    pub retriever: Arc<dyn Retriever>,
    /// Pushes written objects.
    pub sender: Arc<dyn Sender>,
}

impl BackendBinding {
    /// Wire a protocol to a store and a synchronizer.
    #[must_use]
    pub fn new(
        store: Arc<dyn LocalStore>,
        synchronizer: Arc<dyn Synchronizer>,
        protocol: Protocol,
    ) -> Self {
        Self {
            store,
            synchronizer,
            retriever: protocol.retriever,
            sender: protocol.sender,
        }
    }
}

type BackendFactory =
    Arc<dyn Fn(BackendContext) -> BoxFuture<'static, Result<Protocol, BackendError>> + Send + Sync>;

/// Scheme name to protocol factory.
///
/// Built explicitly at startup and passed to whoever constructs overlays.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

impl BackendRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the bundled protocols: `mirror`, `http`, `https` and `s3`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("mirror", mirror::create);
        registry.register("http", http::create);
        registry.register("https", http::create);
        registry.register("s3", s3::create);
        registry
    }

    /// Register `factory` under `scheme`, replacing any previous registration.
    pub fn register<F, Fut>(&mut self, scheme: impl Into<String>, factory: F)
    where
        F: Fn(BackendContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Protocol, BackendError>> + Send + 'static,
    {
        self.factories
            .insert(scheme.into(), Arc::new(move |ctx| factory(ctx).boxed()));
    }

    /// Registered scheme names, sorted.
    #[must_use]
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<_> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Build the protocol registered under `scheme` and bind it.
    pub async fn build(
        &self,
        scheme: &str,
        ctx: BackendContext,
        synchronizer: Arc<dyn Synchronizer>,
    ) -> Result<BackendBinding, BackendError> {
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| BackendError::UnknownScheme(scheme.to_owned()))?;
        let store = Arc::clone(&ctx.store);
        let protocol = factory(ctx).await?;
        tracing::debug!(scheme, "built backend");
        Ok(BackendBinding::new(store, synchronizer, protocol))
    }
}
