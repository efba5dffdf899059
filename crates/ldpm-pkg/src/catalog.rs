//! JSON-LD catalog rendering.
//!
//! A catalog re-expresses a resolved package as a `DataCatalog`. Dataset
//! urls that point into a dependency are rewritten through that
//! dependency's own `name/version` namespace, so the document can be
//! published as linked data without knowing where the files live.

use crate::identifier::LATEST;
use crate::manifest::DatasetEntry;
use crate::resolve::ResolvedNode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const CATALOG_TYPE: &str = "DataCatalog";
const DATASET_TYPE: &str = "DataSet";
const DOWNLOAD_TYPE: &str = "DataDownload";

/// A rendered catalog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogDocument {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(rename = "@id")]
    pub id: String,

    #[serde(rename = "@type")]
    pub kind: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    /// `name/version` of each resolved dependency, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dataset: Vec<DatasetDocument>,

    pub catalog: CatalogRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateTime<Utc>>,

    /// Additional top-level keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogDocument {
    /// Attach the `@context` vocabulary url.
    #[must_use]
    pub fn with_context(mut self, url: impl Into<String>) -> Self {
        self.context = Some(url.into());
        self
    }

    /// Attach a publication timestamp.
    #[must_use]
    pub fn with_date_published(mut self, date: DateTime<Utc>) -> Self {
        self.date_published = Some(date);
        self
    }

    /// Serialize as an indented JSON value.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// One dataset of a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDocument {
    #[serde(rename = "@id")]
    pub id: String,

    #[serde(rename = "@type")]
    pub kind: String,

    pub name: String,

    pub url: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,

    pub distribution: Distribution,

    /// The package that declares this dataset.
    pub catalog: CatalogRef,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a dataset's bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    /// The url exactly as declared in the manifest.
    #[serde(rename = "isBasedOnUrl")]
    pub is_based_on_url: String,

    #[serde(rename = "@type")]
    pub kind: String,
}

/// Back-reference to a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    pub url: String,
}

/// Renders resolved packages as catalogs.
///
/// Identifiers and urls are relative (`name/version/...`) unless a base is
/// set, in which case they are prefixed with it.
#[derive(Debug, Clone, Default)]
pub struct CatalogBuilder {
    base: String,
}

impl CatalogBuilder {
    /// A builder producing relative identifiers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder that prefixes every identifier and url with `base`.
    #[must_use]
    pub fn with_base(base: impl Into<String>) -> Self {
        let mut base = base.into();
        if !base.is_empty() && !base.ends_with('/') {
            base.push('/');
        }
        Self { base }
    }

    /// Render `node`. Pure: no I/O, no clock.
    pub fn render(&self, node: &ResolvedNode) -> CatalogDocument {
        let manifest = &node.manifest;
        let namespace = self.join(&[node.name(), node.version()]);

        let dataset = manifest
            .dataset
            .iter()
            .map(|entry| self.render_dataset(node, &namespace, entry))
            .collect();

        CatalogDocument {
            context: None,
            id: namespace,
            kind: CATALOG_TYPE.to_string(),
            name: node.name().to_string(),
            description: manifest.description.clone(),
            version: node.version().to_string(),
            keywords: manifest.keywords.clone(),
            data_dependencies: node.children.iter().map(|child| child.id.url_path()).collect(),
            dataset,
            catalog: CatalogRef {
                name: node.name().to_string(),
                version: None,
                url: self.join(&[node.name()]),
            },
            date_published: None,
            extra: Map::new(),
        }
    }

    fn render_dataset(
        &self,
        node: &ResolvedNode,
        namespace: &str,
        entry: &DatasetEntry,
    ) -> DatasetDocument {
        let (id, url) = match dependency_target(node, &entry.url) {
            Some((child, rest)) => {
                let id = self.join(&[child.name(), child.version(), &entry.name]);
                let url = self.join(&[child.name(), child.version(), rest]);
                (id, url)
            }
            None if is_absolute(&entry.url) => (
                self.join(&[node.name(), node.version(), &entry.name]),
                entry.url.clone(),
            ),
            None => (
                self.join(&[node.name(), node.version(), &entry.name]),
                self.join(&[node.name(), node.version(), local_path(&entry.url)]),
            ),
        };

        DatasetDocument {
            id,
            kind: DATASET_TYPE.to_string(),
            name: entry.name.clone(),
            url,
            fields: entry.fields.clone(),
            distribution: Distribution {
                is_based_on_url: entry.url.clone(),
                kind: DOWNLOAD_TYPE.to_string(),
            },
            catalog: CatalogRef {
                name: node.name().to_string(),
                version: Some(node.version().to_string()),
                url: namespace.to_string(),
            },
            extra: entry.extra.clone(),
        }
    }

    fn join(&self, segments: &[&str]) -> String {
        let path = segments
            .iter()
            .filter(|segment| !segment.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/");
        format!("{}{}", self.base, path)
    }
}

/// Render with relative identifiers.
pub fn render(node: &ResolvedNode) -> CatalogDocument {
    CatalogBuilder::new().render(node)
}

/// Find the dependency a dataset url points into.
///
/// The url must start with the dependency's name; a following segment equal
/// to its version (or `latest`) is skipped. Returns the child and the
/// remaining path.
fn dependency_target<'n, 'u>(node: &'n ResolvedNode, url: &'u str) -> Option<(&'n ResolvedNode, &'u str)> {
    let url = local_path(url);
    node.children.iter().find_map(|child| {
        let rest = strip_segment(url, child.name())?;
        let rest = strip_segment(rest, child.version())
            .or_else(|| strip_segment(rest, LATEST))
            .unwrap_or(rest);
        Some((child, rest))
    })
}

/// Strip a leading path segment (which may itself contain `/`).
fn strip_segment<'u>(path: &'u str, segment: &str) -> Option<&'u str> {
    let rest = path.strip_prefix(segment)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

fn local_path(url: &str) -> &str {
    url.trim_start_matches("./").trim_start_matches('/')
}

fn is_absolute(url: &str) -> bool {
    url.contains("://")
}
