use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url, header};
use secrecy::{ExposeSecret as _, SecretString};
use thiserror::Error;
use tracing::{debug, instrument};

use super::{BackendContext, BackendError, Protocol, Retriever, Sender};
use crate::content_type::ContentTypes;
use crate::error::FetchError;
use crate::path::PathKey;
use crate::store::LocalStore;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The server answered with a status that is neither success nor "not found".
#[derive(Debug, Error)]
#[error("unexpected HTTP status {0}")]
pub struct UnexpectedStatus(pub StatusCode);

#[derive(Debug, Error)]
#[error("base URL cannot hold a path")]
struct OpaqueBase;

/// Objects served under a base URL: `GET` to retrieve, `PUT` to send.
///
/// Env keys: `url` (required), `timeout` (seconds), `username` and `password` (basic auth).
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    credentials: Option<(String, SecretString)>,
    store: Arc<dyn LocalStore>,
    content_types: Arc<ContentTypes>,
}

impl HttpRemote {
    /// Create a remote rooted at `base`.
    ///
    /// A base without a trailing `/` is treated as a directory anyway, so `http://h/data`
    /// and `http://h/data/` map `/a.txt` to the same URL.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base: Url,
        store: Arc<dyn LocalStore>,
        content_types: Arc<ContentTypes>,
    ) -> Self {
        Self {
            client,
            base,
            credentials: None,
            store,
            content_types,
        }
    }

    /// Authenticate every request with basic auth.
    #[must_use]
    pub fn with_basic_auth(mut self, username: String, password: SecretString) -> Self {
        self.credentials = Some((username, password));
        self
    }

    /// Each key segment becomes one percent-encoded URL path segment.
    fn url_for(&self, key: &PathKey) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::transport(key, OpaqueBase))?
            .pop_if_empty()
            .extend(key.relative().split('/'));
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => req.basic_auth(user, Some(password.expose_secret())),
            None => req,
        }
    }
}

#[async_trait]
impl Retriever for HttpRemote {
    #[instrument(name = "HttpRemote::retrieve", skip(self, key), fields(%key))]
    async fn retrieve(&self, key: &PathKey) -> Result<(), FetchError> {
        let url = self.url_for(key)?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| FetchError::transport(key, e))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Err(FetchError::not_found(key)),
            status if !status.is_success() => {
                return Err(FetchError::transport(key, UnexpectedStatus(status)));
            }
            _ => {}
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::transport(key, e))?;
        debug!(bytes = body.len(), "downloaded");
        self.store.stage(key.as_str(), body).await?;
        Ok(())
    }
}

#[async_trait]
impl Sender for HttpRemote {
    #[instrument(name = "HttpRemote::send", skip(self, key), fields(%key))]
    async fn send(&self, key: &PathKey) -> Result<(), FetchError> {
        let body = self.store.read_all(key.as_str()).await?;
        let url = self.url_for(key)?;
        let response = self
            .authorize(self.client.put(url))
            .header(header::CONTENT_TYPE, self.content_types.resolve(key.as_str()))
            .body(body)
            .send()
            .await
            .map_err(|e| FetchError::transport(key, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::transport(key, UnexpectedStatus(status)));
        }
        debug!(%status, "uploaded");
        Ok(())
    }
}

/// Factory registered as `http` and `https`.
pub async fn create(ctx: BackendContext) -> Result<Protocol, BackendError> {
    let raw = ctx.env.require("url")?;
    let base = Url::parse(raw).map_err(|e| BackendError::InvalidValue {
        key: "url".to_owned(),
        reason: e.to_string(),
    })?;
    if base.cannot_be_a_base() {
        return Err(BackendError::InvalidValue {
            key: "url".to_owned(),
            reason: OpaqueBase.to_string(),
        });
    }
    let timeout = ctx.env.seconds("timeout")?.unwrap_or(DEFAULT_TIMEOUT);
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BackendError::Init(Box::new(e)))?;

    let mut remote = HttpRemote::new(client, base, ctx.store, ctx.content_types);
    if let (Some(user), Some(password)) = (ctx.env.get("username"), ctx.env.secret("password")) {
        remote = remote.with_basic_auth(user.to_owned(), password);
    }
    Ok(Protocol::symmetric(Arc::new(remote)))
}
