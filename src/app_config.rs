//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use overlay_fs::backend::BackendEnv;
use overlay_fs::overlay::SendPolicy;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn default_store_path() -> PathBuf {
    dirs::cache_dir().map_or_else(
        || PathBuf::from("/tmp/overlay-fs/store"),
        |cd| cd.join("overlay-fs").join("store"),
    )
}

const fn default_workers() -> usize {
    4
}

const fn default_shards() -> usize {
    1
}

fn default_scheme() -> String {
    "mirror".to_owned()
}

/// The local store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// The directory the local store lives in.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Wipe the store when the program exits.
    #[serde(default)]
    pub temporary: bool,

    /// Age in seconds after which `expire` removes a stored file.
    #[serde(default)]
    pub expire_after: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            temporary: false,
            expire_after: None,
        }
    }
}

impl StoreConfig {
    pub fn expire_after(&self) -> Option<Duration> {
        self.expire_after.map(Duration::from_secs)
    }
}

/// How remote fetches are executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    /// Maximum number of fetches running at once, per coordinator.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Number of coordinators keys are spread over.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Whether closing a written file waits for the upload.
    #[serde(default)]
    pub send: SendPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            shards: default_shards(),
            send: SendPolicy::default(),
        }
    }
}

/// Which remote backs the store, and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
    /// Registered scheme name, e.g. `mirror`, `https` or `s3`.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Connection parameters handed to the backend as-is.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Like `env`, for values that must never be printed.
    #[serde(default, serialize_with = "serialize_secrets")]
    pub secrets: HashMap<String, SecretString>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            env: HashMap::new(),
            secrets: HashMap::new(),
        }
    }
}

fn serialize_secrets<S>(
    secrets: &HashMap<String, SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap as _;

    let mut map = serializer.serialize_map(Some(secrets.len()))?;
    for key in secrets.keys() {
        map.serialize_entry(key, "****")?;
    }
    map.end()
}

impl BackendConfig {
    /// Everything the backend factory gets, secrets included.
    pub fn backend_env(&self) -> BackendEnv {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(
                self.secrets
                    .iter()
                    .map(|(k, v)| (k.clone(), v.expose_secret().to_owned())),
            )
            .collect()
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.store.path.is_absolute() {
            errors.push(format!(
                "Store path '{}' must be absolute.",
                self.store.path.display()
            ));
        }

        if self.store.expire_after == Some(0) {
            errors.push("store.expire-after must be at least one second.".to_owned());
        }

        if self.fetch.workers == 0 {
            errors.push("fetch.workers must be at least 1.".to_owned());
        }

        if self.fetch.shards == 0 {
            errors.push("fetch.shards must be at least 1.".to_owned());
        }

        if self.backend.scheme.trim().is_empty() {
            errors.push("backend.scheme must not be empty.".to_owned());
        }

        for key in self.backend.secrets.keys() {
            if self.backend.env.contains_key(key) {
                errors.push(format!(
                    "backend key '{key}' is set in both env and secrets."
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("overlay-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("overlay-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/overlay-fs/config.toml"));

        paths
    }

    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads and validates the config, falling back to defaults if no file exists.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match Self::load(external_config_path) {
            Some(res) => res?,
            None => {
                debug!("No configuration file found, using defaults.");
                Self::default()
            }
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}
