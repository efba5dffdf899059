//! Writing resolved packages to disk.
//!
//! Every package directory holds its `package.json`, its data files (and
//! script files when requested) and a `datapackages/` directory with one
//! subdirectory per dependency, recursively:
//!
//! ```text
//! <dest>/<root>/package.json                 top = true
//! <dest>/datapackages/<root>/package.json    top = false
//! <root dir>/datapackages/<child>/package.json
//! ```
//!
//! The full set of paths is computed before anything is written. Files in a
//! package directory that are not part of that set are removed, so writing
//! the same graph twice leaves the same tree.

use crate::cache::write_atomic;
use crate::manifest::{AttachmentKind, Manifest, DEPENDENCIES_DIR, MANIFEST_FILE};
use crate::resolve::ResolvedNode;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while materializing packages.
#[derive(Error, Debug)]
pub enum MaterializeError {
    /// A filesystem operation failed.
    #[error("failed to write '{path}': {source}")]
    WriteFailed { path: PathBuf, source: io::Error },

    /// A manifest could not be serialized.
    #[error("failed to serialize manifest of '{id}': {source}")]
    Serialize {
        id: String,
        source: serde_json::Error,
    },

    /// Two roots with the same name but different versions.
    #[error("cannot install both '{first}' and '{second}' at the same location")]
    DuplicateRoot { first: String, second: String },

    /// Two dependencies of one package share a name but not a version.
    #[error("'{parent}' depends on both '{first}' and '{second}'")]
    ConflictingDependency {
        parent: String,
        first: String,
        second: String,
    },

    /// A root directory already exists and holds something other than the
    /// package being installed.
    #[error("'{path}' exists and does not contain package '{name}'")]
    ForeignDirectory { path: PathBuf, name: String },

    /// An attachment selected for writing was not resolved.
    #[error("attachment '{name}' of '{id}' is not available")]
    MissingAttachment { id: String, name: String },
}

/// Options for `install`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Write roots directly under the destination instead of under
    /// `datapackages/`.
    pub top: bool,
    /// Write script files as well as data files.
    pub all: bool,
    /// Consult and populate the durable cache while resolving.
    pub cache: bool,
}

/// Writes resolved graphs below a destination directory.
#[derive(Debug, Clone)]
pub struct Materializer {
    destination: PathBuf,
    options: InstallOptions,
}

impl Materializer {
    /// Create a materializer for `destination`.
    #[must_use]
    pub fn new(destination: impl Into<PathBuf>, options: InstallOptions) -> Self {
        Self {
            destination: destination.into(),
            options,
        }
    }

    /// Directory a root package is written to.
    #[must_use]
    pub fn root_dir(&self, node: &ResolvedNode) -> PathBuf {
        if self.options.top {
            self.destination.join(node.name())
        } else {
            self.destination.join(DEPENDENCIES_DIR).join(node.name())
        }
    }

    /// Every file that [`materialize`](Self::materialize) would write.
    ///
    /// # Errors
    ///
    /// Returns an error if two packages would claim the same directory or a
    /// selected attachment is missing.
    pub fn plan(&self, nodes: &[ResolvedNode]) -> Result<BTreeSet<PathBuf>, MaterializeError> {
        let mut files = BTreeSet::new();
        for node in unique_roots(nodes)? {
            self.plan_node(node, &self.root_dir(node), &mut files)?;
        }
        Ok(files)
    }

    fn plan_node(
        &self,
        node: &ResolvedNode,
        dir: &Path,
        files: &mut BTreeSet<PathBuf>,
    ) -> Result<(), MaterializeError> {
        for name in self.own_files(node)? {
            files.insert(dir.join(name));
        }
        for child in unique_children(node)? {
            self.plan_node(child, &dependency_dir(dir, child), files)?;
        }
        Ok(())
    }

    /// Write every root and its dependencies. Returns the root directories.
    ///
    /// # Errors
    ///
    /// Returns the first failure. Files already written stay in place;
    /// materializing again repairs the tree. A non-empty root directory
    /// holding anything but the same package is refused before writing.
    pub fn materialize(&self, nodes: &[ResolvedNode]) -> Result<Vec<PathBuf>, MaterializeError> {
        self.plan(nodes)?;

        let roots = unique_roots(nodes)?;
        for node in &roots {
            check_owned(&self.root_dir(node), node)?;
        }
        roots
            .par_iter()
            .map(|node| {
                let dir = self.root_dir(node);
                self.write_node(node, &dir)?;
                tracing::info!(id = %node.id, path = ?dir, "installed");
                Ok::<_, MaterializeError>(dir)
            })
            .collect()
    }

    /// Relative names of the files a node owns directly.
    fn own_files<'n>(&self, node: &'n ResolvedNode) -> Result<Vec<&'n str>, MaterializeError> {
        let mut names = vec![MANIFEST_FILE];
        for (kind, attachment) in node.manifest.attachments() {
            if kind == AttachmentKind::Script && !self.options.all {
                continue;
            }
            if !node.attachments.contains_key(&attachment.name) {
                return Err(MaterializeError::MissingAttachment {
                    id: node.id.to_string(),
                    name: attachment.name.clone(),
                });
            }
            names.push(attachment.name.as_str());
        }
        Ok(names)
    }

    fn write_node(&self, node: &ResolvedNode, dir: &Path) -> Result<(), MaterializeError> {
        let own = self.own_files(node)?;
        let children = unique_children(node)?;

        fs::create_dir_all(dir).map_err(|source| write_failed(dir, source))?;
        let expected: BTreeSet<PathBuf> = own.iter().map(PathBuf::from).collect();
        let dependencies: BTreeSet<&str> = children.iter().map(|c| c.name()).collect();
        remove_stale(dir, Path::new(""), &expected, &dependencies)?;

        let manifest = node
            .manifest
            .to_json_pretty()
            .map_err(|source| MaterializeError::Serialize {
                id: node.id.to_string(),
                source,
            })?;
        let manifest_path = dir.join(MANIFEST_FILE);
        write_atomic(&manifest_path, manifest.as_bytes())
            .map_err(|source| write_failed(&manifest_path, source))?;

        for name in own.iter().filter(|name| **name != MANIFEST_FILE) {
            let path = dir.join(name);
            let bytes = node.attachments.get(*name).ok_or_else(|| {
                MaterializeError::MissingAttachment {
                    id: node.id.to_string(),
                    name: (*name).to_string(),
                }
            })?;
            write_atomic(&path, bytes).map_err(|source| write_failed(&path, source))?;
        }

        children
            .par_iter()
            .map(|child| self.write_node(child, &dependency_dir(dir, child)))
            .collect()
    }
}

/// A non-empty directory is only cleaned when its `package.json` names the
/// package about to be written there.
fn check_owned(dir: &Path, node: &ResolvedNode) -> Result<(), MaterializeError> {
    if !dir.is_dir() || read_dir(dir)?.is_empty() {
        return Ok(());
    }
    let owned = Manifest::from_path(dir.join(MANIFEST_FILE))
        .is_ok_and(|manifest| manifest.name == node.name());
    if owned {
        Ok(())
    } else {
        Err(MaterializeError::ForeignDirectory {
            path: dir.to_path_buf(),
            name: node.name().to_string(),
        })
    }
}

fn dependency_dir(parent: &Path, child: &ResolvedNode) -> PathBuf {
    parent.join(DEPENDENCIES_DIR).join(child.name())
}

fn write_failed(path: &Path, source: io::Error) -> MaterializeError {
    MaterializeError::WriteFailed {
        path: path.to_path_buf(),
        source,
    }
}

/// Roots deduplicated by name; the same name at two versions is an error.
fn unique_roots(nodes: &[ResolvedNode]) -> Result<Vec<&ResolvedNode>, MaterializeError> {
    dedup_by_name(nodes, |first, second| MaterializeError::DuplicateRoot {
        first: first.id.to_string(),
        second: second.id.to_string(),
    })
}

/// Children deduplicated by name, in declaration order.
fn unique_children(node: &ResolvedNode) -> Result<Vec<&ResolvedNode>, MaterializeError> {
    dedup_by_name(&node.children, |first, second| {
        MaterializeError::ConflictingDependency {
            parent: node.id.to_string(),
            first: first.id.to_string(),
            second: second.id.to_string(),
        }
    })
}

fn dedup_by_name<'n>(
    nodes: &'n [ResolvedNode],
    conflict: impl Fn(&ResolvedNode, &ResolvedNode) -> MaterializeError,
) -> Result<Vec<&'n ResolvedNode>, MaterializeError> {
    let mut seen: BTreeMap<&str, &ResolvedNode> = BTreeMap::new();
    let mut unique = Vec::new();
    for node in nodes {
        match seen.get(node.name()) {
            Some(existing) if existing.id == node.id => {}
            Some(existing) => return Err(conflict(existing, node)),
            None => {
                seen.insert(node.name(), node);
                unique.push(node);
            }
        }
    }
    Ok(unique)
}

/// Delete anything under `root/rel` that the plan does not account for.
///
/// `expected` holds file paths relative to `root`; `dependencies` the names
/// of the packages allowed under `datapackages/`. Dependency directories are
/// left to their own pass.
fn remove_stale(
    root: &Path,
    rel: &Path,
    expected: &BTreeSet<PathBuf>,
    dependencies: &BTreeSet<&str>,
) -> Result<(), MaterializeError> {
    let dir = root.join(rel);
    for entry in read_dir(&dir)? {
        let name = entry.file_name();
        let rel_path = rel.join(&name);
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .map_err(|source| write_failed(&path, source))?
            .is_dir();

        if rel.as_os_str().is_empty() && name == DEPENDENCIES_DIR && is_dir {
            remove_stale_dependencies(&path, dependencies)?;
        } else if is_dir {
            remove_stale(root, &rel_path, expected, dependencies)?;
            remove_if_empty(&path)?;
        } else if !expected.contains(&rel_path) {
            tracing::debug!(path = ?path, "removing stale file");
            fs::remove_file(&path).map_err(|source| write_failed(&path, source))?;
        }
    }
    Ok(())
}

/// Remove dependency directories that no longer belong to the package, and
/// anything that is not a directory. Scoped names (`@scope/name`) span two
/// directory levels.
fn remove_stale_dependencies(
    dir: &Path,
    dependencies: &BTreeSet<&str>,
) -> Result<(), MaterializeError> {
    for entry in read_dir(dir)? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('@') && path.is_dir() {
            for scoped in read_dir(&path)? {
                let full = format!("{name}/{}", scoped.file_name().to_string_lossy());
                if !dependencies.contains(full.as_str()) || !scoped.path().is_dir() {
                    remove_path(&scoped.path())?;
                }
            }
            remove_if_empty(&path)?;
        } else if !dependencies.contains(name.as_str()) || !path.is_dir() {
            remove_path(&path)?;
        }
    }
    remove_if_empty(dir)
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>, MaterializeError> {
    fs::read_dir(dir)
        .and_then(|entries| entries.collect::<io::Result<Vec<_>>>())
        .map_err(|source| write_failed(dir, source))
}

fn remove_path(path: &Path) -> Result<(), MaterializeError> {
    tracing::debug!(path = ?path, "removing stale dependency");
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|source| write_failed(path, source))
}

fn remove_if_empty(dir: &Path) -> Result<(), MaterializeError> {
    if read_dir(dir)?.is_empty() {
        fs::remove_dir(dir).map_err(|source| write_failed(dir, source))?;
    }
    Ok(())
}
