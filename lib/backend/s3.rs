use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use secrecy::ExposeSecret as _;
use tracing::{debug, instrument};

use super::{BackendContext, BackendError, Protocol, Retriever, Sender};
use crate::content_type::ContentTypes;
use crate::error::FetchError;
use crate::path::PathKey;
use crate::store::LocalStore;

/// Objects in an S3-compatible bucket.
///
/// Env keys: `bucket` (required), `prefix`, `region`, `endpoint`, `access-key`, `secret-key`,
/// `path-style`. Without explicit keys the default AWS credential chain applies.
pub struct S3Remote {
    client: Client,
    bucket: String,
    prefix: String,
    store: Arc<dyn LocalStore>,
    content_types: Arc<ContentTypes>,
}

impl S3Remote {
    /// Keys are looked up under `prefix` in `bucket`; leading and trailing `/` are ignored.
    #[must_use]
    pub fn new(
        client: Client,
        bucket: impl Into<String>,
        prefix: &str,
        store: Arc<dyn LocalStore>,
        content_types: Arc<ContentTypes>,
    ) -> Self {
        let prefix = prefix.trim_matches('/');
        Self {
            client,
            bucket: bucket.into(),
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("{prefix}/")
            },
            store,
            content_types,
        }
    }

    fn object_key(&self, key: &PathKey) -> String {
        format!("{}{}", self.prefix, key.relative())
    }
}

#[async_trait]
impl Retriever for S3Remote {
    #[instrument(name = "S3Remote::retrieve", skip(self, key), fields(%key, bucket = %self.bucket))]
    async fn retrieve(&self, key: &PathKey) -> Result<(), FetchError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if matches!(err.as_service_error(), Some(GetObjectError::NoSuchKey(_))) => {
                return Err(FetchError::not_found(key));
            }
            Err(err) => return Err(FetchError::transport(key, err)),
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| FetchError::transport(key, e))?
            .into_bytes();
        debug!(bytes = data.len(), "downloaded object");
        self.store.stage(key.as_str(), data).await?;
        Ok(())
    }
}

#[async_trait]
impl Sender for S3Remote {
    #[instrument(name = "S3Remote::send", skip(self, key), fields(%key, bucket = %self.bucket))]
    async fn send(&self, key: &PathKey) -> Result<(), FetchError> {
        let data = self.store.read_all(key.as_str()).await?;
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .content_type(self.content_types.resolve(key.as_str()))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| FetchError::transport(key, e))?;
        debug!(bytes = size, "uploaded object");
        Ok(())
    }
}

/// Factory registered as `s3`.
pub async fn create(ctx: BackendContext) -> Result<Protocol, BackendError> {
    let env = &ctx.env;
    let bucket = env.require("bucket")?.to_owned();
    let prefix = env.get("prefix").unwrap_or_default().to_owned();
    let path_style = env.parse::<bool>("path-style")?.unwrap_or(false);

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = env.get("region") {
        loader = loader.region(Region::new(region.to_owned()));
    }
    if let Some(endpoint) = env.get("endpoint") {
        loader = loader.endpoint_url(endpoint);
    }
    if let (Some(access_key), Some(secret_key)) = (env.get("access-key"), env.secret("secret-key"))
    {
        loader = loader.credentials_provider(Credentials::new(
            access_key,
            secret_key.expose_secret(),
            None,
            None,
            "overlay-fs",
        ));
    }
    let shared = loader.load().await;
    let config = aws_sdk_s3::config::Builder::from(&shared)
        .force_path_style(path_style)
        .build();

    debug!(%bucket, %prefix, path_style, "configured S3 client");
    let remote = S3Remote::new(
        Client::from_conf(config),
        bucket,
        &prefix,
        ctx.store,
        ctx.content_types,
    );
    Ok(Protocol::symmetric(Arc::new(remote)))
}
