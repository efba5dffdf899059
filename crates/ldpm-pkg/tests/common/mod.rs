//! Shared registry fixtures.

#![allow(dead_code)]

use ldpm_pkg::{Attachment, Attachments, Config, DatasetEntry, Manifest, MemoryRegistry, PackageId};
use std::path::Path;
use std::sync::Arc;

pub const X1: &[u8] = b"a,b\n1,2\n3,4\n";
pub const X2: &[u8] = b"a,b\n5,6\n";
pub const TEST_R: &[u8] = b"x <- read.csv('x1.csv')\nsummary(x)\n";

pub fn attachment(name: &str, content_type: &str, bytes: &[u8]) -> Attachment {
    Attachment {
        name: name.to_string(),
        content_type: content_type.to_string(),
        length: bytes.len() as u64,
    }
}

pub fn mydpkg_test() -> (Manifest, Attachments) {
    let mut manifest = Manifest::new("mydpkg-test", "0.0.0");
    manifest.description = Some("my datapackage".to_string());
    manifest.data_files = vec![
        attachment("x1.csv", "text/csv", X1),
        attachment("x2.csv", "text/csv", X2),
    ];
    manifest.script_files = vec![attachment("scripts/test.r", "text/plain", TEST_R)];
    manifest.dataset = vec![dataset("csv1", "x1.csv", &["a", "b"])];

    let mut attachments = Attachments::new();
    attachments.insert("x1.csv".to_string(), X1.to_vec());
    attachments.insert("x2.csv".to_string(), X2.to_vec());
    attachments.insert("scripts/test.r".to_string(), TEST_R.to_vec());
    (manifest, attachments)
}

pub fn req_test() -> Manifest {
    let mut manifest = Manifest::new("req-test", "0.0.0");
    manifest.description = Some("a test for dataDependencies".to_string());
    manifest.keywords = vec!["test".to_string(), "datapackage".to_string()];
    manifest.data_dependencies = vec![PackageId::parse("mydpkg-test@0.0.0").unwrap()];
    manifest.dataset = vec![dataset("azerty", "mydpkg-test/0.0.0/csv1", &["a"])];
    manifest
}

pub fn dataset(name: &str, url: &str, fields: &[&str]) -> DatasetEntry {
    serde_json::from_value(serde_json::json!({ "name": name, "url": url, "fields": fields }))
        .unwrap()
}

/// A registry holding `mydpkg-test@0.0.0` and `req-test@0.0.0`.
pub fn registry() -> Arc<MemoryRegistry> {
    let registry = Arc::new(MemoryRegistry::new());
    let (manifest, attachments) = mydpkg_test();
    registry.publish(manifest, attachments).unwrap();
    registry.publish(req_test(), Attachments::new()).unwrap();
    registry
}

/// Publish a package with no attachments.
pub fn publish(registry: &MemoryRegistry, spec: &str, dependencies: &[&str]) {
    let id = PackageId::parse(spec).unwrap();
    let mut manifest = Manifest::new(id.name(), id.version());
    manifest.data_dependencies = dependencies
        .iter()
        .map(|dep| PackageId::parse(dep).unwrap())
        .collect();
    registry.publish(manifest, Attachments::new()).unwrap();
}

pub fn config(cache_dir: &Path) -> Config {
    Config {
        registry: "http://127.0.0.1:3000".to_string(),
        cache_dir: cache_dir.to_path_buf(),
        ..Config::default()
    }
}

pub fn id(spec: &str) -> PackageId {
    PackageId::parse(spec).unwrap()
}

/// Relative paths of every file below `root`, sorted, with `/` separators.
pub fn files(root: &Path) -> Vec<String> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                let rel = path.strip_prefix(root).unwrap();
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    let mut out = Vec::new();
    if root.exists() {
        walk(root, root, &mut out);
    }
    out.sort();
    out
}
