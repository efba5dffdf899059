//! Durable store of fetched packages.
//!
//! Published versions never change, so an entry is valid forever once
//! written. Layout:
//!
//! ```text
//! <root>/<name>/<version>/entry.json     identifier, manifest, file checksums
//! <root>/<name>/<version>/files/<path>   attachment contents
//! ```
//!
//! Every file goes through a temp file and a rename, attachments before
//! `entry.json`, so readers only ever see complete entries and concurrent
//! writers of the same key cannot corrupt it.

use crate::identifier::PackageId;
use crate::manifest::Manifest;
use crate::registry::{Attachments, FetchedPackage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the per-entry index file.
pub const ENTRY_FILE: &str = "entry.json";

/// Directory holding attachment contents inside an entry.
const FILES_DIR: &str = "files";

/// Errors that can occur while reading or writing the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error at '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("cache entry '{path}' is unreadable: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("cache entry for '{id}' is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

/// A package as it was fetched from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Pinned identifier the entry is keyed by.
    pub id: PackageId,
    /// The fetched manifest.
    pub manifest: Manifest,
    /// Attachment contents by name.
    pub attachments: Attachments,
    /// When the registry fetch happened.
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Wrap a fresh registry fetch.
    #[must_use]
    pub fn new(id: PackageId, fetched: FetchedPackage) -> Self {
        Self {
            id,
            manifest: fetched.manifest,
            attachments: fetched.attachments,
            fetched_at: Utc::now(),
        }
    }
}

/// What `entry.json` holds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRecord {
    id: PackageId,
    manifest: Manifest,
    /// SHA-256 of every attachment, by name.
    files: BTreeMap<String, String>,
    fetched_at: DateTime<Utc>,
}

/// Keyed store consulted before any registry fetch.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Option<PathBuf>,
}

impl CacheStore {
    /// A store persisting entries below `root`.
    #[must_use]
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// A pass-through store that always misses and never writes.
    #[must_use]
    pub fn disabled() -> Self {
        Self { root: None }
    }

    /// Whether entries are read and written at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Root directory, if enabled.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn entry_dir(&self, id: &PackageId) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(id.name()).join(id.version()))
    }

    /// Look up an entry. Unreadable entries are logged and count as misses.
    pub fn get(&self, id: &PackageId) -> Option<CacheEntry> {
        match self.try_get(id) {
            Ok(Some(entry)) => {
                tracing::debug!(id = %id, "cache hit");
                Some(entry)
            }
            Ok(None) => {
                if self.is_enabled() {
                    tracing::debug!(id = %id, "cache miss");
                }
                None
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "ignoring unusable cache entry");
                None
            }
        }
    }

    /// Store an entry. Failures are logged; the cache is never required.
    pub fn put(&self, entry: &CacheEntry) {
        if let Err(e) = self.try_put(entry) {
            tracing::warn!(id = %entry.id, error = %e, "failed to write cache entry");
        }
    }

    /// Look up an entry, reporting why an existing one cannot be used.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry exists but is incomplete or corrupt.
    pub fn try_get(&self, id: &PackageId) -> Result<Option<CacheEntry>, CacheError> {
        let Some(dir) = self.entry_dir(id) else {
            return Ok(None);
        };
        let entry_path = dir.join(ENTRY_FILE);
        let content = match fs::read(&entry_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Io {
                    path: entry_path,
                    source,
                })
            }
        };
        let record: EntryRecord =
            serde_json::from_slice(&content).map_err(|source| CacheError::Json {
                path: entry_path.clone(),
                source,
            })?;

        let corrupt = |reason: String| CacheError::Corrupt {
            id: id.to_string(),
            reason,
        };
        if record.id != *id {
            return Err(corrupt(format!("entry is keyed as '{}'", record.id)));
        }
        record
            .manifest
            .validate()
            .map_err(|e| corrupt(e.to_string()))?;
        let declared: Vec<&str> = record
            .manifest
            .attachments()
            .map(|(_, a)| a.name.as_str())
            .collect();
        if declared.len() != record.files.len()
            || declared.iter().any(|name| !record.files.contains_key(*name))
        {
            return Err(corrupt("file list does not match manifest".to_string()));
        }

        let files_dir = dir.join(FILES_DIR);
        let mut attachments = Attachments::new();
        for (name, checksum) in &record.files {
            let path = files_dir.join(name);
            let bytes = fs::read(&path).map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
            if calculate_checksum(&bytes) != *checksum {
                return Err(corrupt(format!("checksum mismatch for '{name}'")));
            }
            attachments.insert(name.clone(), bytes);
        }

        Ok(Some(CacheEntry {
            id: record.id,
            manifest: record.manifest,
            attachments,
            fetched_at: record.fetched_at,
        }))
    }

    /// Store an entry, overwriting any previous one for the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn try_put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let Some(dir) = self.entry_dir(&entry.id) else {
            return Ok(());
        };
        let files_dir = dir.join(FILES_DIR);

        let mut files = BTreeMap::new();
        for (name, bytes) in &entry.attachments {
            let path = files_dir.join(name);
            write_atomic(&path, bytes).map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
            files.insert(name.clone(), calculate_checksum(bytes));
        }

        let record = EntryRecord {
            id: entry.id.clone(),
            manifest: entry.manifest.clone(),
            files,
            fetched_at: entry.fetched_at,
        };
        let entry_path = dir.join(ENTRY_FILE);
        let content = serde_json::to_vec_pretty(&record).map_err(|source| CacheError::Json {
            path: entry_path.clone(),
            source,
        })?;
        write_atomic(&entry_path, &content).map_err(|source| CacheError::Io {
            path: entry_path.clone(),
            source,
        })?;
        tracing::debug!(id = %entry.id, "cached");
        Ok(())
    }

    /// Remove every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be removed.
    pub fn clear(&self) -> Result<(), CacheError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        match fs::remove_dir_all(root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                path: root.clone(),
                source,
            }),
        }
    }
}

/// Calculate SHA256 checksum of data.
fn calculate_checksum(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
