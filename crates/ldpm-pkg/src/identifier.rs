//! Package identifiers (`name`, `name@version`).
//!
//! A bare `name` refers to the latest published version. Scoped names
//! (`@scope/name`) keep their leading `@`; only the last `@` after the first
//! character separates the version.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Placeholder version meaning "whatever the registry currently publishes".
pub const LATEST: &str = "latest";

/// Error produced when a package reference cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid package identifier '{input}': {reason}")]
pub struct IdentifierError {
    /// The string that failed to parse.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// A reference to a data package, possibly still pointing at `latest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId {
    name: String,
    version: String,
}

impl PackageId {
    /// Build an identifier from its parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or malformed, or the version is empty.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self, IdentifierError> {
        let name = name.into();
        let version = version.into();
        validate_name(&name).map_err(|reason| IdentifierError {
            input: format!("{name}@{version}"),
            reason,
        })?;
        validate_version(&version).map_err(|reason| IdentifierError {
            input: format!("{name}@{version}"),
            reason,
        })?;
        Ok(Self { name, version })
    }

    /// Identifier for the latest version of `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or malformed.
    pub fn latest(name: impl Into<String>) -> Result<Self, IdentifierError> {
        Self::new(name, LATEST)
    }

    /// Parse `name` or `name@version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, contains whitespace, or an
    /// explicit `@` is followed by nothing.
    pub fn parse(input: &str) -> Result<Self, IdentifierError> {
        let invalid = |reason| IdentifierError {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("name cannot be empty"));
        }

        // A leading '@' belongs to the scope, never to the version.
        let (name, version) = match trimmed.rfind('@') {
            Some(at_pos) if at_pos > 0 => {
                let version = &trimmed[at_pos + 1..];
                if version.is_empty() {
                    return Err(invalid("version after '@' cannot be empty"));
                }
                (&trimmed[..at_pos], version)
            }
            _ => (trimmed, LATEST),
        };

        validate_name(name).map_err(invalid)?;
        validate_version(version).map_err(invalid)?;

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// The package name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version, which may still be [`LATEST`].
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether this identifier still needs a registry lookup to pin its version.
    #[must_use]
    pub fn is_latest(&self) -> bool {
        self.version == LATEST
    }

    /// Linked-data path form, `name/version`.
    #[must_use]
    pub fn url_path(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.chars().any(char::is_whitespace) {
        return Err("name cannot contain whitespace");
    }
    if let Some(scoped) = name.strip_prefix('@') {
        let Some((scope, rest)) = scoped.split_once('/') else {
            return Err("scoped name must have the form '@scope/name'");
        };
        if scope.is_empty() || rest.is_empty() || rest.contains('/') || rest.contains('@') {
            return Err("scoped name must have the form '@scope/name'");
        }
    } else if name.contains('/') || name.contains('@') {
        return Err("name cannot contain '/' or '@'");
    }
    if name.split('/').any(|part| part == "." || part == "..") {
        return Err("name cannot be a relative path segment");
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<(), &'static str> {
    if version.is_empty() {
        return Err("version cannot be empty");
    }
    if version.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
        return Err("version cannot contain whitespace or path separators");
    }
    if version == "." || version == ".." {
        return Err("version cannot be a relative path segment");
    }
    Ok(())
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for PackageId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PackageId> for String {
    fn from(id: PackageId) -> Self {
        id.to_string()
    }
}
