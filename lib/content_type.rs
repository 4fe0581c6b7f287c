//! Media type lookup by file suffix.
//!
//! The table is built once and never mutated afterwards; components that need it hold an
//! `Arc<ContentTypes>`.

use std::collections::HashMap;

use thiserror::Error;

/// Media type used when nothing more specific is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

const DEFAULTS: [(&str, &str); 10] = [
    (".htm", "text/html"),
    (".html", "text/html"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".json", "application/json"),
    (".log", "text/plain"),
    (".png", "image/png"),
    (".text", "text/plain"),
    (".txt", "text/plain"),
    (".xml", "text/xml"),
];

/// Rejected suffix registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentTypeError {
    /// Empty, or containing an inner dot.
    #[error("invalid suffix: {0:?}")]
    InvalidSuffix(String),
}

/// Immutable suffix to media type table.
#[derive(Debug, Clone)]
pub struct ContentTypes {
    by_suffix: HashMap<String, String>,
}

impl Default for ContentTypes {
    fn default() -> Self {
        ContentTypesBuilder::new().build()
    }
}

impl ContentTypes {
    /// Start from the built-in table.
    #[must_use]
    pub fn builder() -> ContentTypesBuilder {
        ContentTypesBuilder::new()
    }

    /// Media type for the last segment of `path`, or [`OCTET_STREAM`].
    #[must_use]
    pub fn resolve(&self, path: &str) -> &str {
        let name = path.rsplit('/').next().unwrap_or(path);
        name.rfind('.')
            .and_then(|i| self.by_suffix.get(&name[i..].to_ascii_lowercase()))
            .map_or(OCTET_STREAM, String::as_str)
    }
}

/// Collects registrations before the table is frozen.
#[derive(Debug)]
pub struct ContentTypesBuilder {
    by_suffix: HashMap<String, String>,
}

impl ContentTypesBuilder {
    fn new() -> Self {
        Self {
            by_suffix: DEFAULTS
                .iter()
                .map(|(s, t)| ((*s).to_owned(), (*t).to_owned()))
                .collect(),
        }
    }

    /// Register `suffix` (with or without the leading dot). Existing entries win.
    pub fn register(
        mut self,
        suffix: &str,
        content_type: impl Into<String>,
    ) -> Result<Self, ContentTypeError> {
        let trimmed = suffix.trim().to_ascii_lowercase();
        let key = match trimmed.rfind('.') {
            None if !trimmed.is_empty() => format!(".{trimmed}"),
            Some(0) if trimmed.len() > 1 => trimmed,
            _ => return Err(ContentTypeError::InvalidSuffix(suffix.to_owned())),
        };
        self.by_suffix.entry(key).or_insert_with(|| content_type.into());
        Ok(self)
    }

    /// Freeze the table.
    #[must_use]
    pub fn build(self) -> ContentTypes {
        ContentTypes {
            by_suffix: self.by_suffix,
        }
    }
}
