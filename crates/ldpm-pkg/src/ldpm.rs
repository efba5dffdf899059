//! The `resolve` / `install` / `cat` entry points.

use crate::cache::CacheStore;
use crate::catalog::{CatalogBuilder, CatalogDocument};
use crate::config::{Config, ConfigError};
use crate::identifier::PackageId;
use crate::materialize::{InstallOptions, MaterializeError, Materializer};
use crate::registry::{Registry, RegistryClient, RegistryError};
use crate::resolve::{ResolveError, ResolvedNode, Resolver};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`Ldpm`].
#[derive(Error, Debug)]
pub enum LdpmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),
}

/// A configured client: one registry, one durable cache.
pub struct Ldpm {
    config: Config,
    registry: Arc<dyn Registry>,
    cache: CacheStore,
}

impl Ldpm {
    /// Create a client talking to the configured HTTP registry.
    pub fn new(config: Config) -> Result<Self, LdpmError> {
        config.validate()?;
        let registry = RegistryClient::with_config(&config)?;
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    /// Create a client backed by any registry.
    pub fn with_registry(config: Config, registry: Arc<dyn Registry>) -> Self {
        let cache = CacheStore::open(config.cache_dir.clone());
        Self {
            config,
            registry,
            cache,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The durable cache.
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    fn resolver<'a>(&'a self, cache: &'a CacheStore) -> Resolver<'a> {
        Resolver::new(self.registry.as_ref(), cache)
            .with_max_concurrency(self.config.max_concurrent_fetches)
    }

    /// Resolve the dependency graphs of `ids` (manifests only).
    ///
    /// Cached entries are read but nothing is written to the cache, so
    /// packages not yet installed with `cache` are fetched on every call.
    ///
    /// # Errors
    ///
    /// Returns the first failing root's error; nothing partial is returned.
    pub fn resolve(&self, ids: &[PackageId]) -> Result<Vec<ResolvedNode>, LdpmError> {
        let nodes = self
            .resolver(&self.cache)
            .with_attachments(false)
            .resolve(ids)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    /// Resolve `ids` with attachments and write them below `destination`.
    /// Returns the directories of the installed roots.
    pub fn install(
        &self,
        ids: &[PackageId],
        options: InstallOptions,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, LdpmError> {
        let disabled = CacheStore::disabled();
        let cache = if options.cache { &self.cache } else { &disabled };

        let nodes = self
            .resolver(cache)
            .resolve(ids)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let roots = Materializer::new(destination, options).materialize(&nodes)?;
        tracing::info!(
            packages = nodes.iter().map(ResolvedNode::count).sum::<usize>(),
            destination = ?destination,
            "install complete"
        );
        Ok(roots)
    }

    /// Render the catalog of `id` with `@context` and `datePublished`.
    /// Like [`Ldpm::resolve`], reads the cache without writing to it.
    pub fn cat(&self, id: &PackageId) -> Result<CatalogDocument, LdpmError> {
        let node = self.resolver(&self.cache).with_attachments(false).resolve_one(id)?;
        let published = node.manifest.date_published.unwrap_or_else(Utc::now);

        Ok(CatalogBuilder::new()
            .render(&node)
            .with_context(self.config.context_url())
            .with_date_published(published))
    }
}

impl std::fmt::Debug for Ldpm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ldpm")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
