//! Lock file format (`plinth.lock`).
//!
//! The lock file pins exact versions, sources, and checksums. Entries are
//! kept sorted by identity and dependency maps are ordered, so serializing the
//! same resolution twice yields identical bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::hash::Sha256Digest;
use crate::identity::PackageIdentity;
use crate::version::Version;

/// File name of the lock file in a project workspace.
pub const LOCK_FILE: &str = "plinth.lock";

/// Current lock format version.
pub const LOCK_FORMAT_VERSION: u32 = 1;

/// A locked package entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Package identity.
    pub name: PackageIdentity,
    /// Exact resolved version.
    pub version: Version,
    /// Source the version was resolved from.
    pub source: String,
    /// Archive checksum.
    pub checksum: Sha256Digest,
    /// Archive size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Resolved versions of the declared dependencies.
    #[serde(default)]
    pub dependencies: BTreeMap<PackageIdentity, Version>,
}

/// The lock file document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    /// Lock format version.
    pub version: u32,
    /// When the resolution was computed.
    pub resolved_at: DateTime<Utc>,
    /// Root package of the resolution, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PackageIdentity>,
    /// Locked packages, sorted by identity.
    #[serde(default)]
    pub package: Vec<LockEntry>,
}

impl LockFile {
    /// Parse a lock file document.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Document`] if the TOML is malformed, a field
    /// fails validation, the format version is unsupported, or an identity
    /// appears twice.
    pub fn from_toml_str(content: &str) -> Result<Self, ParseError> {
        let lock: LockFile = toml::from_str(content).map_err(|e| ParseError::Document {
            document: LOCK_FILE,
            reason: e.to_string(),
        })?;
        if lock.version != LOCK_FORMAT_VERSION {
            return Err(ParseError::Document {
                document: LOCK_FILE,
                reason: format!("unsupported lock format version {}", lock.version),
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for entry in &lock.package {
            if !seen.insert(&entry.name) {
                return Err(ParseError::Document {
                    document: LOCK_FILE,
                    reason: format!("{} is locked more than once", entry.name),
                });
            }
        }
        Ok(lock)
    }

    /// Serialize to TOML with entries in identity order.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Document`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ParseError> {
        let mut sorted = self.clone();
        sorted.package.sort_by(|a, b| a.name.cmp(&b.name));
        toml::to_string_pretty(&sorted).map_err(|e| ParseError::Document {
            document: LOCK_FILE,
            reason: e.to_string(),
        })
    }

    /// Find an entry by identity.
    pub fn find(&self, identity: &PackageIdentity) -> Option<&LockEntry> {
        self.package.iter().find(|p| &p.name == identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> LockEntry {
        LockEntry {
            name: name.parse().unwrap(),
            version: "1.0.0".parse().unwrap(),
            source: "local".into(),
            checksum: Sha256Digest::from_bytes([3; 32]),
            size: 42,
            dependencies: BTreeMap::new(),
        }
    }

    #[test]
    fn serialization_is_stable() {
        let lock = LockFile {
            version: LOCK_FORMAT_VERSION,
            resolved_at: "2026-01-02T03:04:05Z".parse().unwrap(),
            root: Some("zeta".parse().unwrap()),
            package: vec![entry("zeta"), entry("@acme/alpha"), entry("beta")],
        };
        let first = lock.to_toml_string().unwrap();
        let reparsed = LockFile::from_toml_str(&first).unwrap();
        assert_eq!(reparsed.to_toml_string().unwrap(), first);
        assert_eq!(reparsed.package[0].name.to_string(), "beta");
        assert_eq!(reparsed.package[2].name.to_string(), "@acme/alpha");
    }

    #[test]
    fn rejects_duplicates_and_unknown_versions() {
        let dup = LockFile {
            version: LOCK_FORMAT_VERSION,
            resolved_at: Utc::now(),
            root: None,
            package: vec![entry("a"), entry("a")],
        };
        let text = toml::to_string_pretty(&dup).unwrap();
        assert!(LockFile::from_toml_str(&text).is_err());

        let future = text.replace("version = 1\n", "version = 9\n");
        assert!(LockFile::from_toml_str(&future).is_err());
    }
}
