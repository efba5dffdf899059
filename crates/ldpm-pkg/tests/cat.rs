//! Catalog rendering through the client.

mod common;

use common::{config, id, registry};
use ldpm_pkg::{Ldpm, LdpmError, ResolveError};
use serde_json::json;

#[test]
fn test_cat_req_test() {
    let cache = tempfile::tempdir().unwrap();
    let ldpm = Ldpm::with_registry(config(cache.path()), registry());

    let doc = ldpm.cat(&id("req-test")).unwrap();
    let mut value = serde_json::to_value(&doc).unwrap();
    let object = value.as_object_mut().unwrap();
    assert!(object.remove("datePublished").is_some());

    assert_eq!(
        value,
        json!({
            "@context": "http://127.0.0.1:3000/contexts/datapackage.jsonld",
            "@id": "req-test/0.0.0",
            "@type": "DataCatalog",
            "name": "req-test",
            "description": "a test for dataDependencies",
            "version": "0.0.0",
            "keywords": ["test", "datapackage"],
            "dataDependencies": ["mydpkg-test/0.0.0"],
            "dataset": [{
                "@id": "mydpkg-test/0.0.0/azerty",
                "@type": "DataSet",
                "name": "azerty",
                "url": "mydpkg-test/0.0.0/csv1",
                "fields": ["a"],
                "distribution": {
                    "isBasedOnUrl": "mydpkg-test/0.0.0/csv1",
                    "@type": "DataDownload"
                },
                "catalog": { "name": "req-test", "version": "0.0.0", "url": "req-test/0.0.0" }
            }],
            "catalog": { "name": "req-test", "url": "req-test" }
        })
    );
}

#[test]
fn test_cat_does_not_download_attachments() {
    let cache = tempfile::tempdir().unwrap();
    let ldpm = Ldpm::with_registry(config(cache.path()), registry());

    ldpm.cat(&id("mydpkg-test@0.0.0")).unwrap();

    assert!(!cache.path().join("mydpkg-test").exists());
}

#[test]
fn test_cat_missing_package() {
    let cache = tempfile::tempdir().unwrap();
    let ldpm = Ldpm::with_registry(config(cache.path()), registry());

    let err = ldpm.cat(&id("does-not-exist")).unwrap_err();
    assert!(matches!(
        err,
        LdpmError::Resolve(ResolveError::PackageNotFound(ref id)) if id == "does-not-exist@latest"
    ));
}
