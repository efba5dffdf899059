//! Access to the remote data package registry.
//!
//! The registry exposes one JSON document per `name@version` plus its
//! attachments:
//!
//! ```text
//! GET {registry}/{name}/latest             manifest of the latest version
//! GET {registry}/{name}/{version}          manifest
//! GET {registry}/{name}/{version}/{file}   raw attachment bytes
//! ```
//!
//! [`Registry`] is the seam the resolver depends on. [`RegistryClient`] talks
//! HTTP; [`MemoryRegistry`] serves packages from memory.

use crate::config::Config;
use crate::identifier::PackageId;
use crate::manifest::{Manifest, ManifestError};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use semver::Version;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Attachment contents keyed by attachment name.
pub type Attachments = BTreeMap<String, Vec<u8>>;

/// Characters left unescaped in a URL path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'@');

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The registry has no such package or version.
    #[error("'{0}' not found in registry")]
    NotFound(String),

    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status other than 404.
    #[error("registry returned status {status} for {url}")]
    Status { url: String, status: u16 },

    /// The response body was not the expected JSON.
    #[error("JSON error: {0}")]
    Json(String),

    /// The manifest document failed validation.
    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),

    /// An attachment did not match its declared size.
    #[error("attachment '{name}' has {actual} bytes, manifest declares {expected}")]
    LengthMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// The version is already published.
    #[error("'{0}' is already published")]
    Conflict(String),
}

/// A manifest together with the contents of its attachments.
#[derive(Debug, Clone)]
pub struct FetchedPackage {
    /// The package manifest.
    pub manifest: Manifest,
    /// Attachment contents by name.
    pub attachments: Attachments,
}

/// Source of manifests and attachments.
///
/// Implementations must be safe to call from several resolver threads at once.
pub trait Registry: Send + Sync {
    /// The version currently published as latest for `name`.
    fn latest_version(&self, name: &str) -> Result<String, RegistryError>;

    /// The manifest of a pinned identifier.
    fn manifest(&self, id: &PackageId) -> Result<Manifest, RegistryError>;

    /// Every attachment of a pinned identifier.
    fn attachments(&self, id: &PackageId) -> Result<Attachments, RegistryError>;

    /// Manifest and attachments in one call.
    fn fetch(&self, id: &PackageId) -> Result<FetchedPackage, RegistryError> {
        let manifest = self.manifest(id)?;
        let attachments = self.attachments(id)?;
        Ok(FetchedPackage {
            manifest,
            attachments,
        })
    }
}

/// HTTP client for the registry.
pub struct RegistryClient {
    base_url: String,
    http_client: reqwest::blocking::Client,
}

impl RegistryClient {
    /// Create a client for the registry named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_config(config: &Config) -> Result<Self, RegistryError> {
        let http_client = reqwest::blocking::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        Ok(Self {
            base_url: config.registry_url().to_string(),
            http_client,
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of a document below the registry root, one path segment per item.
    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.extend(utf8_percent_encode(segment, SEGMENT));
        }
        url
    }

    /// URL of an attachment; its `/` separators stay path separators.
    fn attachment_url(&self, id: &PackageId, name: &str) -> String {
        let mut segments = vec![id.name(), id.version()];
        segments.extend(name.split('/'));
        self.url(&segments)
    }

    /// GET `url`, mapping 404 to [`RegistryError::NotFound`] for `what`.
    fn get(&self, url: &str, what: &str) -> Result<Vec<u8>, RegistryError> {
        tracing::debug!(url, "GET");
        let response = self
            .http_client
            .get(url)
            .send()
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(RegistryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| RegistryError::Network(e.to_string()))
    }

    fn get_manifest(&self, url: &str, what: &str) -> Result<Manifest, RegistryError> {
        let body = self.get(url, what)?;
        Manifest::from_slice(&body).map_err(|e| match e {
            ManifestError::Parse(e) => RegistryError::Json(e.to_string()),
            other => RegistryError::InvalidManifest(other),
        })
    }

    fn download_attachments(
        &self,
        id: &PackageId,
        manifest: &Manifest,
    ) -> Result<Attachments, RegistryError> {
        let mut attachments = Attachments::new();
        for (_, attachment) in manifest.attachments() {
            let url = self.attachment_url(id, &attachment.name);
            // A missing attachment is a broken publication, not a missing package.
            let bytes = self.get(&url, &attachment.name).map_err(|e| match e {
                RegistryError::NotFound(_) => RegistryError::Status {
                    url: url.clone(),
                    status: 404,
                },
                other => other,
            })?;
            let actual = bytes.len() as u64;
            if actual != attachment.length {
                return Err(RegistryError::LengthMismatch {
                    name: attachment.name.clone(),
                    expected: attachment.length,
                    actual,
                });
            }
            attachments.insert(attachment.name.clone(), bytes);
        }
        Ok(attachments)
    }
}

impl Registry for RegistryClient {
    fn latest_version(&self, name: &str) -> Result<String, RegistryError> {
        let url = self.url(&[name, crate::identifier::LATEST]);
        Ok(self.get_manifest(&url, name)?.version)
    }

    fn manifest(&self, id: &PackageId) -> Result<Manifest, RegistryError> {
        let url = self.url(&[id.name(), id.version()]);
        self.get_manifest(&url, &id.to_string())
    }

    fn attachments(&self, id: &PackageId) -> Result<Attachments, RegistryError> {
        let manifest = self.manifest(id)?;
        self.download_attachments(id, &manifest)
    }

    fn fetch(&self, id: &PackageId) -> Result<FetchedPackage, RegistryError> {
        let manifest = self.manifest(id)?;
        let attachments = self.download_attachments(id, &manifest)?;
        Ok(FetchedPackage {
            manifest,
            attachments,
        })
    }
}

/// A registry held in memory.
///
/// Serves fixtures offline and counts manifest fetches, which makes cache
/// behaviour observable.
#[derive(Default)]
pub struct MemoryRegistry {
    packages: RwLock<BTreeMap<String, BTreeMap<Version, FetchedPackage>>>,
    manifest_fetches: AtomicUsize,
}

impl MemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a package. Published versions are immutable.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is invalid, an attachment is missing or
    /// has the wrong size, or the version already exists.
    pub fn publish(&self, manifest: Manifest, attachments: Attachments) -> Result<(), RegistryError> {
        manifest.validate()?;
        let version = Version::parse(&manifest.version).map_err(|e| {
            ManifestError::InvalidVersion(manifest.version.clone(), e.to_string())
        })?;
        for (_, attachment) in manifest.attachments() {
            let actual = attachments.get(&attachment.name).map_or(0, |b| b.len() as u64);
            if actual != attachment.length {
                return Err(RegistryError::LengthMismatch {
                    name: attachment.name.clone(),
                    expected: attachment.length,
                    actual,
                });
            }
        }

        let mut packages = self
            .packages
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let versions = packages.entry(manifest.name.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(RegistryError::Conflict(format!(
                "{}@{}",
                manifest.name, manifest.version
            )));
        }
        versions.insert(
            version,
            FetchedPackage {
                manifest,
                attachments,
            },
        );
        Ok(())
    }

    /// Number of manifest fetches served so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    fn lookup(&self, id: &PackageId) -> Result<FetchedPackage, RegistryError> {
        let not_found = || RegistryError::NotFound(id.to_string());
        let version = Version::parse(id.version()).map_err(|_| not_found())?;
        let packages = self
            .packages
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        packages
            .get(id.name())
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(not_found)
    }
}

impl Registry for MemoryRegistry {
    fn latest_version(&self, name: &str) -> Result<String, RegistryError> {
        let packages = self
            .packages
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        packages
            .get(name)
            .and_then(|versions| versions.keys().next_back())
            .map(ToString::to_string)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    fn manifest(&self, id: &PackageId) -> Result<Manifest, RegistryError> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.lookup(id)?.manifest)
    }

    fn attachments(&self, id: &PackageId) -> Result<Attachments, RegistryError> {
        Ok(self.lookup(id)?.attachments)
    }
}
