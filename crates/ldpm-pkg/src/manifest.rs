//! Data package manifest (`package.json`) parsing and validation.

use crate::identifier::{IdentifierError, PackageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

/// The manifest filename written into every materialized package directory.
pub const MANIFEST_FILE: &str = "package.json";

/// Directory under which a package's data dependencies are nested.
pub const DEPENDENCIES_DIR: &str = "datapackages";

/// Longest package name accepted by the registry.
const MAX_NAME_LEN: usize = 214;

/// Errors that can occur when working with manifests.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid package name '{0}': {1}")]
    InvalidName(String, &'static str),

    #[error("invalid version '{0}': {1}")]
    InvalidVersion(String, String),

    #[error("invalid attachment '{name}': {reason}")]
    InvalidAttachment { name: String, reason: &'static str },
}

/// The declared metadata of one data package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Package name (required).
    pub name: String,

    /// Concrete semantic version (required).
    pub version: String,

    /// Short description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Keywords for package discovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    /// Packages this one depends on for data, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_dependencies: Vec<PackageId>,

    /// Datasets described by this package.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dataset: Vec<DatasetEntry>,

    /// Attachments holding data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_files: Vec<Attachment>,

    /// Attachments holding scripts that produced or process the data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script_files: Vec<Attachment>,

    /// Publication timestamp stamped by the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateTime<Utc>>,

    /// Fields this crate does not interpret, kept for round trips.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One dataset declared by a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// Dataset name, unique within the package.
    pub name: String,

    /// Location relative to the owning package. A first segment naming a data
    /// dependency points into that dependency.
    pub url: String,

    /// Column names.
    #[serde(default)]
    pub fields: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Descriptor of a file bundled with a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Path of the file relative to the package directory.
    pub name: String,

    /// MIME type.
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Size in bytes.
    pub length: u64,
}

fn default_content_type() -> String {
    String::from("application/octet-stream")
}

/// The class an attachment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    /// Data files, always installed.
    Data,
    /// Script files, installed only on request.
    Script,
}

impl std::fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Script => write!(f, "script"),
        }
    }
}

impl Manifest {
    /// Create an empty manifest for `name@version`.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            keywords: Vec::new(),
            data_dependencies: Vec::new(),
            dataset: Vec::new(),
            data_files: Vec::new(),
            script_files: Vec::new(),
            date_published: None,
            extra: Map::new(),
        }
    }

    /// Load a manifest from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = std::fs::read(path)?;
        Self::from_slice(&content)
    }

    /// Parse and validate a manifest from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the manifest fails validation.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        Self::from_slice(content.as_bytes())
    }

    /// Parse and validate a manifest from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the manifest fails validation.
    pub fn from_slice(content: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_slice(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the manifest for everything the resolver and materializer rely on.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ManifestError> {
        self.validate_name()?;
        self.validate_version()?;
        self.validate_attachments()?;
        Ok(())
    }

    fn validate_name(&self) -> Result<(), ManifestError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(ManifestError::InvalidName(
                self.name.clone(),
                "name cannot exceed 214 characters",
            ));
        }
        PackageId::latest(self.name.as_str())
            .map(|_| ())
            .map_err(|e| ManifestError::InvalidName(self.name.clone(), e.reason))
    }

    fn validate_version(&self) -> Result<(), ManifestError> {
        semver::Version::parse(&self.version)
            .map_err(|e| ManifestError::InvalidVersion(self.version.clone(), e.to_string()))?;
        Ok(())
    }

    fn validate_attachments(&self) -> Result<(), ManifestError> {
        let mut seen = BTreeSet::new();
        for (_, attachment) in self.attachments() {
            let invalid = |reason| ManifestError::InvalidAttachment {
                name: attachment.name.clone(),
                reason,
            };
            validate_relative_path(&attachment.name).map_err(invalid)?;
            if attachment.name == MANIFEST_FILE {
                return Err(invalid("'package.json' is reserved for the manifest"));
            }
            if attachment.name.split('/').next() == Some(DEPENDENCIES_DIR) {
                return Err(invalid("'datapackages/' is reserved for dependencies"));
            }
            if !seen.insert(attachment.name.as_str()) {
                return Err(invalid("declared more than once"));
            }
        }
        Ok(())
    }

    /// The pinned identifier of this manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or version is not a valid identifier part.
    pub fn id(&self) -> Result<PackageId, IdentifierError> {
        PackageId::new(self.name.as_str(), self.version.as_str())
    }

    /// All attachment descriptors, data files first.
    pub fn attachments(&self) -> impl Iterator<Item = (AttachmentKind, &Attachment)> {
        self.data_files
            .iter()
            .map(|a| (AttachmentKind::Data, a))
            .chain(self.script_files.iter().map(|a| (AttachmentKind::Script, a)))
    }

    /// Serialize the manifest as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Reject absolute paths, parent references and empty segments.
pub(crate) fn validate_relative_path(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.contains('\\') || name.contains(':') {
        return Err("name must use '/' separators and no drive prefix");
    }
    if name.starts_with('/') {
        return Err("name must be a relative path");
    }
    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err("name cannot contain empty, '.' or '..' segments");
    }
    Ok(())
}
