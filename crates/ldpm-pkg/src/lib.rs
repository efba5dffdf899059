//! Client library for a linked-data package registry.
//!
//! This crate provides:
//! - Parsing of `name@version` package identifiers
//! - `package.json` manifests with data and script attachments
//! - A blocking HTTP registry client and an in-memory registry
//! - A durable on-disk cache of fetched packages
//! - Concurrent resolution of transitive `dataDependencies`
//! - Materialization of resolved packages into `datapackages/` trees
//! - Rendering of resolved packages as JSON-LD catalogs

mod cache;
mod catalog;
mod config;
mod identifier;
mod ldpm;
mod manifest;
mod materialize;
mod registry;
mod resolve;

pub use cache::{CacheEntry, CacheError, CacheStore, ENTRY_FILE};
pub use catalog::{render, CatalogBuilder, CatalogDocument, CatalogRef, DatasetDocument, Distribution};
pub use config::{Config, ConfigError, CACHE_DIR_ENV, CONFIG_FILE, DEFAULT_REGISTRY, REGISTRY_ENV};
pub use identifier::{IdentifierError, PackageId, LATEST};
pub use ldpm::{Ldpm, LdpmError};
pub use manifest::{
    Attachment, AttachmentKind, DatasetEntry, Manifest, ManifestError, DEPENDENCIES_DIR,
    MANIFEST_FILE,
};
pub use materialize::{InstallOptions, MaterializeError, Materializer};
pub use registry::{
    Attachments, FetchedPackage, MemoryRegistry, Registry, RegistryClient, RegistryError,
};
pub use resolve::{ResolveError, ResolvedNode, Resolver, Walk, DEFAULT_MAX_CONCURRENCY};
