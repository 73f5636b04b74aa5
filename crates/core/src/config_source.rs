//! Pipeline configuration resolution.
//!
//! A configuration arrives either as an already-parsed
//! [`ConfigurationDocument`] or as a string reference: a `file:` URI or an
//! `http(s):` URL. Remote documents are untrusted: any plugin package that
//! looks like a local path is rejected before the document is handed out,
//! so a remote config can never make the daemon load arbitrary local code.

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::Deserialize;

use crate::plugin::{ConfigurationDocument, PipelineDefinition, PluginSlot};

/// Where a configuration comes from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConfigSource {
    /// A `file:` URI or `http(s):` URL.
    Reference(String),
    /// An in-memory document; resolved without I/O.
    Document(ConfigurationDocument),
}

impl From<ConfigurationDocument> for ConfigSource {
    fn from(doc: ConfigurationDocument) -> Self {
        Self::Document(doc)
    }
}

impl From<String> for ConfigSource {
    fn from(reference: String) -> Self {
        Self::Reference(reference)
    }
}

impl From<&str> for ConfigSource {
    fn from(reference: &str) -> Self {
        Self::Reference(reference.to_string())
    }
}

/// Errors raised while resolving a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Missing or unrecognised URI scheme.
    #[error("Unsupported configuration protocol: {reference}")]
    UnsupportedProtocol { reference: String },

    /// A remote document names a local-looking package.
    #[error("Invalid plugin reference for {slot}: {package}")]
    InvalidPluginReference { slot: PluginSlot, package: String },

    /// Reading a local configuration file failed.
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server answered with a non-2xx status.
    #[error("Remote configuration error ({status}): {body}")]
    RemoteStatus { status: u16, body: String },

    /// The document is not valid JSON or does not have the expected shape.
    #[error("Malformed configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Fetches, validates and flattens pipeline configurations.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    client: reqwest::Client,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling, custom TLS).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Resolve `source` into a configuration document.
    pub async fn resolve(
        &self,
        source: impl Into<ConfigSource>,
    ) -> Result<ConfigurationDocument, ResolveError> {
        let reference = match source.into() {
            ConfigSource::Document(doc) => return Ok(doc),
            ConfigSource::Reference(reference) => reference,
        };

        // A bare path is not a URL; callers must use an explicit `file:` URI.
        let url = Url::parse(&reference).map_err(|_| ResolveError::UnsupportedProtocol {
            reference: reference.clone(),
        })?;

        match url.scheme() {
            "http" | "https" => {
                let doc = self.fetch_remote(url).await?;
                validate_remote_document(&doc)?;
                Ok(doc)
            }
            "file" => read_local(&url, &reference).await,
            _ => Err(ResolveError::UnsupportedProtocol { reference }),
        }
    }

    /// Resolve `source` and flatten it into a [`PipelineDefinition`].
    pub async fn resolve_as_pipeline(
        &self,
        source: impl Into<ConfigSource>,
    ) -> Result<PipelineDefinition, ResolveError> {
        let doc = self.resolve(source).await?;
        Ok(PipelineDefinition::from_document(&doc))
    }

    async fn fetch_remote(&self, url: Url) -> Result<ConfigurationDocument, ResolveError> {
        tracing::debug!(url = %url, "Fetching remote pipeline configuration");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ResolveError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Reject any plugin whose package looks like a local path.
///
/// Applied to every document fetched over HTTP. A package is rejected when
/// it is an absolute path or starts with `.` (`./x`, `../x`, `.hidden`).
pub fn validate_remote_document(doc: &ConfigurationDocument) -> Result<(), ResolveError> {
    for (slot, plugin) in doc.plugins.iter() {
        if is_local_reference(&plugin.package) {
            tracing::warn!(
                slot = %slot,
                package = %plugin.package,
                "Rejected remote configuration with local plugin reference",
            );
            return Err(ResolveError::InvalidPluginReference {
                slot,
                package: plugin.package.clone(),
            });
        }
    }
    Ok(())
}

fn is_local_reference(package: &str) -> bool {
    package.starts_with('.') || package.starts_with('/') || Path::new(package).is_absolute()
}

async fn read_local(url: &Url, reference: &str) -> Result<ConfigurationDocument, ResolveError> {
    let path = url
        .to_file_path()
        .map_err(|()| ResolveError::UnsupportedProtocol {
            reference: reference.to_string(),
        })?;

    tracing::debug!(path = %path.display(), "Reading local pipeline configuration");

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| ResolveError::Io { path, source })?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
