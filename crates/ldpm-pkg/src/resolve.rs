//! Dependency resolution for data packages.
//!
//! This module provides:
//! - Pinning of `latest` references to concrete versions
//! - Transitive expansion of `dataDependencies` into a tree of [`ResolvedNode`]s
//! - Cycle detection along each dependency path
//! - One registry fetch per `name@version` per run, even under concurrency

use crate::cache::{CacheEntry, CacheStore};
use crate::identifier::{IdentifierError, PackageId};
use crate::manifest::Manifest;
use crate::registry::{Attachments, FetchedPackage, Registry, RegistryError};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;

/// Default bound on registry fetches in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Errors that can occur during dependency resolution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// A reference string could not be parsed.
    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),

    /// The registry has no such package, version or latest version.
    #[error("package '{0}' not found")]
    PackageNotFound(String),

    /// A dependency edge closes a cycle.
    #[error("cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// The registry could not be reached or answered with an error.
    #[error("failed to fetch '{id}': {reason}")]
    FetchFailed { id: String, reason: String },

    /// The registry served a manifest that cannot be used.
    #[error("invalid manifest for '{id}': {reason}")]
    InvalidManifest { id: String, reason: String },
}

/// A package with its manifest, attachments and resolved dependencies.
///
/// Two positions in the tree that resolve to the same `name@version` share
/// manifest and attachment data, but are separate nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedNode {
    /// Pinned identifier.
    pub id: PackageId,
    /// The package manifest.
    pub manifest: Arc<Manifest>,
    /// Attachment contents by name. Empty when attachments were not requested.
    pub attachments: Arc<Attachments>,
    /// One node per `dataDependencies` entry, in declaration order.
    pub children: Vec<ResolvedNode>,
}

impl ResolvedNode {
    /// Package name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.id.name()
    }

    /// Pinned version.
    #[must_use]
    pub fn version(&self) -> &str {
        self.id.version()
    }

    /// Pre-order traversal yielding each node with its depth (root is 0).
    #[must_use]
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(0, self)],
        }
    }

    /// Number of nodes in this tree, counting repeats.
    #[must_use]
    pub fn count(&self) -> usize {
        self.walk().count()
    }

    /// The direct dependency named `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&ResolvedNode> {
        self.children.iter().find(|c| c.name() == name)
    }
}

/// Pre-order iterator over a [`ResolvedNode`] tree.
pub struct Walk<'a> {
    stack: Vec<(usize, &'a ResolvedNode)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, &'a ResolvedNode);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, node) = self.stack.pop()?;
        self.stack
            .extend(node.children.iter().rev().map(|child| (depth + 1, child)));
        Some((depth, node))
    }
}

/// Shared result of one fetch.
#[derive(Debug)]
struct Fetched {
    manifest: Arc<Manifest>,
    attachments: Arc<Attachments>,
}

type Memo<K, V> = Mutex<HashMap<K, Arc<OnceLock<Result<V, ResolveError>>>>>;

/// Per-run memo. The first caller for a key performs the work; concurrent
/// callers block on the same cell and share its result.
#[derive(Default)]
struct Run {
    fetches: Memo<PackageId, Arc<Fetched>>,
    latest: Memo<String, String>,
}

fn memoize<K: Eq + Hash + Clone, V: Clone>(
    memo: &Memo<K, V>,
    key: &K,
    init: impl FnOnce() -> Result<V, ResolveError>,
) -> Result<V, ResolveError> {
    let cell = {
        let mut map = memo.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(key.clone()).or_default())
    };
    cell.get_or_init(init).clone()
}

/// Dependency resolver backed by a registry and a cache.
pub struct Resolver<'a> {
    registry: &'a dyn Registry,
    cache: &'a CacheStore,
    max_concurrency: usize,
    fetch_attachments: bool,
}

impl<'a> Resolver<'a> {
    /// Create a resolver that fetches attachments and uses the default
    /// concurrency bound.
    #[must_use]
    pub fn new(registry: &'a dyn Registry, cache: &'a CacheStore) -> Self {
        Self {
            registry,
            cache,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            fetch_attachments: true,
        }
    }

    /// Bound the number of fetches in flight at once (at least 1).
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Whether attachment contents are needed. Without them a cache miss
    /// downloads only the manifest and nothing is written to the cache.
    #[must_use]
    pub fn with_attachments(mut self, fetch: bool) -> Self {
        self.fetch_attachments = fetch;
        self
    }

    /// Resolve each root independently. Results keep the order of `roots`; a
    /// failing root does not affect the others.
    pub fn resolve(&self, roots: &[PackageId]) -> Vec<Result<ResolvedNode, ResolveError>> {
        let run = Run::default();
        let work = || {
            roots
                .par_iter()
                .map(|root| self.resolve_node(&run, root, &[]))
                .collect::<Vec<_>>()
        };

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_concurrency)
            .thread_name(|i| format!("ldpm-resolve-{i}"))
            .build()
        {
            Ok(pool) => pool.install(work),
            Err(e) => {
                tracing::warn!(error = %e, "could not start resolver pool, using the global pool");
                work()
            }
        }
    }

    /// Resolve a single root.
    ///
    /// # Errors
    ///
    /// Returns the first error met anywhere in the root's dependency tree.
    pub fn resolve_one(&self, root: &PackageId) -> Result<ResolvedNode, ResolveError> {
        self.resolve(std::slice::from_ref(root))
            .pop()
            .unwrap_or_else(|| Err(ResolveError::PackageNotFound(root.to_string())))
    }

    fn resolve_node(
        &self,
        run: &Run,
        requested: &PackageId,
        path: &[PackageId],
    ) -> Result<ResolvedNode, ResolveError> {
        let id = self.pin(run, requested)?;

        if let Some(start) = path.iter().position(|p| *p == id) {
            let cycle = path[start..]
                .iter()
                .chain(std::iter::once(&id))
                .map(ToString::to_string)
                .collect();
            return Err(ResolveError::CyclicDependency { cycle });
        }

        let fetched = memoize(&run.fetches, &id, || self.fetch(requested, &id))?;

        let mut child_path = path.to_vec();
        child_path.push(id.clone());
        let children = fetched
            .manifest
            .data_dependencies
            .par_iter()
            .map(|dep| self.resolve_node(run, dep, &child_path))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(id = %id, depth = path.len(), children = children.len(), "resolved");
        Ok(ResolvedNode {
            id,
            manifest: Arc::clone(&fetched.manifest),
            attachments: Arc::clone(&fetched.attachments),
            children,
        })
    }

    /// Replace `latest` with the version the registry currently publishes.
    fn pin(&self, run: &Run, requested: &PackageId) -> Result<PackageId, ResolveError> {
        if !requested.is_latest() {
            return Ok(requested.clone());
        }
        let name = requested.name().to_string();
        let version = memoize(&run.latest, &name, || {
            tracing::debug!(name = %name, "looking up latest version");
            self.registry
                .latest_version(&name)
                .map_err(|e| registry_error(requested, e))
        })?;
        Ok(PackageId::new(name, version)?)
    }

    /// Cache lookup, then registry fetch on a miss.
    fn fetch(&self, requested: &PackageId, id: &PackageId) -> Result<Arc<Fetched>, ResolveError> {
        if let Some(entry) = self.cache.get(id) {
            return Ok(Arc::new(Fetched {
                manifest: Arc::new(entry.manifest),
                attachments: Arc::new(entry.attachments),
            }));
        }

        tracing::debug!(id = %id, attachments = self.fetch_attachments, "fetching from registry");
        let result = if self.fetch_attachments {
            self.registry.fetch(id)
        } else {
            self.registry.manifest(id).map(|manifest| FetchedPackage {
                manifest,
                attachments: Attachments::new(),
            })
        };
        let mut fetched = result.map_err(|e| registry_error(requested, e))?;

        check_fetched(id, &fetched, self.fetch_attachments)?;
        drop_undeclared(id, &mut fetched);

        if self.fetch_attachments && self.cache.is_enabled() {
            let entry = CacheEntry::new(id.clone(), fetched);
            self.cache.put(&entry);
            return Ok(Arc::new(Fetched {
                manifest: Arc::new(entry.manifest),
                attachments: Arc::new(entry.attachments),
            }));
        }

        Ok(Arc::new(Fetched {
            manifest: Arc::new(fetched.manifest),
            attachments: Arc::new(fetched.attachments),
        }))
    }
}

/// Discard attachments the manifest does not declare.
fn drop_undeclared(id: &PackageId, fetched: &mut FetchedPackage) {
    let declared: BTreeSet<&str> = fetched
        .manifest
        .attachments()
        .map(|(_, a)| a.name.as_str())
        .collect();
    fetched.attachments.retain(|name, _| {
        let keep = declared.contains(name.as_str());
        if !keep {
            tracing::debug!(id = %id, name = %name, "ignoring undeclared attachment");
        }
        keep
    });
}

/// Make sure the registry answered for the package that was asked for.
fn check_fetched(
    id: &PackageId,
    fetched: &FetchedPackage,
    with_attachments: bool,
) -> Result<(), ResolveError> {
    let invalid = |reason: String| ResolveError::InvalidManifest {
        id: id.to_string(),
        reason,
    };
    let manifest = &fetched.manifest;
    if manifest.name != id.name() || manifest.version != id.version() {
        return Err(invalid(format!(
            "registry returned '{}@{}'",
            manifest.name, manifest.version
        )));
    }
    manifest.validate().map_err(|e| invalid(e.to_string()))?;
    if with_attachments {
        if let Some((_, missing)) = manifest
            .attachments()
            .find(|(_, a)| !fetched.attachments.contains_key(&a.name))
        {
            return Err(invalid(format!("attachment '{}' was not served", missing.name)));
        }
    }
    Ok(())
}

fn registry_error(requested: &PackageId, error: RegistryError) -> ResolveError {
    let id = requested.to_string();
    match error {
        RegistryError::NotFound(_) => ResolveError::PackageNotFound(id),
        RegistryError::InvalidManifest(e) => ResolveError::InvalidManifest {
            id,
            reason: e.to_string(),
        },
        other => ResolveError::FetchFailed {
            id,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Attachment;
    use crate::registry::MemoryRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn id(s: &str) -> PackageId {
        PackageId::parse(s).unwrap()
    }

    /// Publish `name@version` depending on `deps`, with one data file.
    fn publish(registry: &MemoryRegistry, spec: &str, deps: &[&str]) {
        let pkg = id(spec);
        let mut manifest = Manifest::new(pkg.name(), pkg.version());
        manifest.data_dependencies = deps.iter().map(|d| id(d)).collect();
        let content = format!("{pkg}\n").into_bytes();
        manifest.data_files.push(Attachment {
            name: "data.csv".to_string(),
            content_type: "text/csv".to_string(),
            length: content.len() as u64,
        });
        let mut attachments = Attachments::new();
        attachments.insert("data.csv".to_string(), content);
        registry.publish(manifest, attachments).unwrap();
    }

    #[test]
    fn resolves_children_in_declaration_order() {
        let registry = MemoryRegistry::new();
        publish(&registry, "zeta@1.0.0", &[]);
        publish(&registry, "alpha@1.0.0", &[]);
        publish(&registry, "root@1.0.0", &["zeta@1.0.0", "alpha@1.0.0"]);
        let cache = CacheStore::disabled();

        let node = Resolver::new(&registry, &cache)
            .resolve_one(&id("root@1.0.0"))
            .unwrap();

        assert_eq!(node.id, id("root@1.0.0"));
        assert_eq!(node.children.len(), node.manifest.data_dependencies.len());
        let names: Vec<_> = node.children.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(node.attachments["data.csv"], b"root@1.0.0\n");
    }

    #[test]
    fn latest_is_pinned_before_lookup() {
        let registry = MemoryRegistry::new();
        publish(&registry, "dep@0.1.0", &[]);
        publish(&registry, "dep@0.2.0", &[]);
        publish(&registry, "root@1.0.0", &["dep"]);
        let cache = CacheStore::disabled();

        let node = Resolver::new(&registry, &cache)
            .resolve_one(&id("root"))
            .unwrap();

        assert_eq!(node.id.to_string(), "root@1.0.0");
        assert_eq!(node.children[0].id.to_string(), "dep@0.2.0");
    }

    #[test]
    fn missing_root_reports_requested_identifier() {
        let registry = MemoryRegistry::new();
        let cache = CacheStore::disabled();

        let err = Resolver::new(&registry, &cache)
            .resolve_one(&id("reqxddwdwdw@0.0.0"))
            .unwrap_err();
        assert_eq!(err, ResolveError::PackageNotFound("reqxddwdwdw@0.0.0".to_string()));

        let err = Resolver::new(&registry, &cache)
            .resolve_one(&id("nothing"))
            .unwrap_err();
        assert_eq!(err, ResolveError::PackageNotFound("nothing@latest".to_string()));
    }

    #[test]
    fn missing_dependency_aborts_the_root() {
        let registry = MemoryRegistry::new();
        publish(&registry, "root@1.0.0", &["ghost@9.9.9"]);
        let cache = CacheStore::disabled();

        let err = Resolver::new(&registry, &cache)
            .resolve_one(&id("root@1.0.0"))
            .unwrap_err();
        assert_eq!(err, ResolveError::PackageNotFound("ghost@9.9.9".to_string()));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = MemoryRegistry::new();
        publish(&registry, "loop@1.0.0", &["loop@1.0.0"]);
        let cache = CacheStore::disabled();

        let err = Resolver::new(&registry, &cache)
            .resolve_one(&id("loop@1.0.0"))
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::CyclicDependency {
                cycle: vec!["loop@1.0.0".to_string(), "loop@1.0.0".to_string()]
            }
        );
    }

    #[test]
    fn mutual_dependency_is_a_cycle() {
        let registry = MemoryRegistry::new();
        publish(&registry, "a@1.0.0", &["b@1.0.0"]);
        publish(&registry, "b@1.0.0", &["c"]);
        publish(&registry, "c@1.0.0", &["a@1.0.0"]);
        let cache = CacheStore::disabled();

        let err = Resolver::new(&registry, &cache)
            .resolve_one(&id("a@1.0.0"))
            .unwrap_err();
        match err {
            ResolveError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a@1.0.0", "b@1.0.0", "c@1.0.0", "a@1.0.0"]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn shared_dependency_is_fetched_once() {
        let registry = MemoryRegistry::new();
        publish(&registry, "base@1.0.0", &[]);
        publish(&registry, "left@1.0.0", &["base@1.0.0"]);
        publish(&registry, "right@1.0.0", &["base@1.0.0"]);
        publish(&registry, "top@1.0.0", &["left@1.0.0", "right@1.0.0", "base@1.0.0"]);
        let cache = CacheStore::disabled();

        let node = Resolver::new(&registry, &cache)
            .resolve_one(&id("top@1.0.0"))
            .unwrap();

        assert_eq!(registry.fetch_count(), 4);
        assert_eq!(node.count(), 6);
        let left_base = &node.children[0].children[0];
        let right_base = &node.children[1].children[0];
        assert!(Arc::ptr_eq(&left_base.manifest, &right_base.manifest));
    }

    #[test]
    fn cache_avoids_refetching_across_runs() {
        let registry = MemoryRegistry::new();
        publish(&registry, "dep@1.0.0", &[]);
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path());

        for _ in 0..2 {
            Resolver::new(&registry, &cache)
                .resolve_one(&id("dep@1.0.0"))
                .unwrap();
        }
        assert_eq!(registry.fetch_count(), 1);
    }

    #[test]
    fn disabled_cache_fetches_every_run() {
        let registry = MemoryRegistry::new();
        publish(&registry, "dep@1.0.0", &[]);
        let cache = CacheStore::disabled();

        for _ in 0..2 {
            Resolver::new(&registry, &cache)
                .resolve_one(&id("dep@1.0.0"))
                .unwrap();
        }
        assert_eq!(registry.fetch_count(), 2);
    }

    #[test]
    fn roots_fail_independently() {
        let registry = MemoryRegistry::new();
        publish(&registry, "good@1.0.0", &[]);
        let cache = CacheStore::disabled();

        let results = Resolver::new(&registry, &cache)
            .resolve(&[id("good@1.0.0"), id("bad@1.0.0"), id("good@1.0.0")]);

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ResolveError::PackageNotFound(_))));
        assert!(results[2].is_ok());
        assert_eq!(registry.fetch_count(), 2);
    }

    #[test]
    fn manifest_only_resolution_skips_attachments_and_cache() {
        let registry = MemoryRegistry::new();
        publish(&registry, "dep@1.0.0", &[]);
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path());

        let node = Resolver::new(&registry, &cache)
            .with_attachments(false)
            .resolve_one(&id("dep@1.0.0"))
            .unwrap();

        assert!(node.attachments.is_empty());
        assert!(cache.get(&id("dep@1.0.0")).is_none());
    }

    #[test]
    fn single_slot_pool_still_resolves_deep_trees() {
        let registry = MemoryRegistry::new();
        publish(&registry, "d@1.0.0", &[]);
        publish(&registry, "c@1.0.0", &["d@1.0.0"]);
        publish(&registry, "b@1.0.0", &["c@1.0.0", "d@1.0.0"]);
        publish(&registry, "a@1.0.0", &["b@1.0.0", "c@1.0.0"]);
        let cache = CacheStore::disabled();

        let node = Resolver::new(&registry, &cache)
            .with_max_concurrency(1)
            .resolve_one(&id("a@1.0.0"))
            .unwrap();

        let order: Vec<_> = node.walk().map(|(depth, n)| (depth, n.name())).collect();
        assert_eq!(
            order,
            vec![(0, "a"), (1, "b"), (2, "c"), (3, "d"), (2, "d"), (1, "c"), (2, "d")]
        );
    }

    struct BrokenRegistry;

    impl Registry for BrokenRegistry {
        fn latest_version(&self, _name: &str) -> Result<String, RegistryError> {
            Ok("1.0.0".to_string())
        }

        fn manifest(&self, id: &PackageId) -> Result<Manifest, RegistryError> {
            match id.name() {
                "offline" => Err(RegistryError::Network("connection refused".to_string())),
                _ => Ok(Manifest::new("someone-else", "1.0.0")),
            }
        }

        fn attachments(&self, _id: &PackageId) -> Result<Attachments, RegistryError> {
            Ok(Attachments::new())
        }
    }

    #[test]
    fn transport_failure_is_fetch_failed() {
        let cache = CacheStore::disabled();
        let err = Resolver::new(&BrokenRegistry, &cache)
            .resolve_one(&id("offline"))
            .unwrap_err();
        match err {
            ResolveError::FetchFailed { id, reason } => {
                assert_eq!(id, "offline@latest");
                assert!(reason.contains("connection refused"));
            }
            other => panic!("expected FetchFailed, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_manifest_is_rejected() {
        let cache = CacheStore::disabled();
        let err = Resolver::new(&BrokenRegistry, &cache)
            .resolve_one(&id("wanted@1.0.0"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidManifest { id, .. } if id == "wanted@1.0.0"));
    }

    /// Serves an extra file alongside the declared ones.
    struct ExtraFileRegistry(MemoryRegistry);

    impl Registry for ExtraFileRegistry {
        fn latest_version(&self, name: &str) -> Result<String, RegistryError> {
            self.0.latest_version(name)
        }

        fn manifest(&self, id: &PackageId) -> Result<Manifest, RegistryError> {
            self.0.manifest(id)
        }

        fn attachments(&self, id: &PackageId) -> Result<Attachments, RegistryError> {
            let mut attachments = self.0.attachments(id)?;
            attachments.insert("README.md".to_string(), b"# extra\n".to_vec());
            Ok(attachments)
        }
    }

    #[test]
    fn undeclared_attachments_do_not_defeat_the_cache() {
        let registry = ExtraFileRegistry(MemoryRegistry::new());
        publish(&registry.0, "dep@1.0.0", &[]);
        let dir = tempfile::tempdir().unwrap();

        for _ in 0..3 {
            let cache = CacheStore::open(dir.path());
            let node = Resolver::new(&registry, &cache)
                .resolve_one(&id("dep@1.0.0"))
                .unwrap();
            assert_eq!(node.attachments.keys().collect::<Vec<_>>(), vec!["data.csv"]);
        }
        assert_eq!(registry.0.fetch_count(), 1);
    }

    /// Sleeps in every manifest fetch and records the peak number in flight.
    #[derive(Default)]
    struct SlowRegistry {
        inner: MemoryRegistry,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Registry for SlowRegistry {
        fn latest_version(&self, name: &str) -> Result<String, RegistryError> {
            self.inner.latest_version(name)
        }

        fn manifest(&self, id: &PackageId) -> Result<Manifest, RegistryError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            let result = self.inner.manifest(id);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn attachments(&self, id: &PackageId) -> Result<Attachments, RegistryError> {
            self.inner.attachments(id)
        }
    }

    #[test]
    fn fetches_in_flight_never_exceed_the_bound() {
        let registry = SlowRegistry::default();
        let leaves: Vec<String> = (0..16).map(|i| format!("leaf-{i}@1.0.0")).collect();
        for leaf in &leaves {
            publish(&registry.inner, leaf, &[]);
        }
        let deps: Vec<&str> = leaves.iter().map(String::as_str).collect();
        publish(&registry.inner, "wide@1.0.0", &deps);
        let cache = CacheStore::disabled();

        let node = Resolver::new(&registry, &cache)
            .with_max_concurrency(3)
            .resolve_one(&id("wide@1.0.0"))
            .unwrap();

        assert_eq!(node.children.len(), 16);
        let peak = registry.peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak in flight was {peak}");
    }
}
