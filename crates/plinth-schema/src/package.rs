//! Registry records: published versions, package metadata, and signatures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::hash::Sha256Digest;
use crate::identity::PackageIdentity;
use crate::tag::{DependencySpec, TagName};
use crate::version::Version;

/// One published version of a package.
///
/// Immutable once stored, except for `yanked` and `tags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersion {
    /// Package identity.
    pub identity: PackageIdentity,
    /// Concrete version.
    pub version: Version,
    /// SHA-256 of the archive bytes.
    pub checksum: Sha256Digest,
    /// Archive size in bytes.
    pub size: u64,
    /// Declared dependencies.
    #[serde(default)]
    pub dependencies: BTreeMap<PackageIdentity, DependencySpec>,
    /// Yanked versions stay fetchable but are skipped by resolution.
    #[serde(default)]
    pub yanked: bool,
    /// Dist-tags currently pointing at this version.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<TagName>,
    /// Publisher signature over the archive bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureRecord>,
    /// When the version was published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl PackageVersion {
    /// Whether `tag` currently points at this version.
    pub fn has_tag(&self, tag: &TagName) -> bool {
        self.tags.contains(tag)
    }
}

/// Everything a registry knows about one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Package identity.
    pub identity: PackageIdentity,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Every published version, yanked ones included.
    #[serde(default)]
    pub versions: Vec<PackageVersion>,
    /// Dist-tag table.
    #[serde(default)]
    pub dist_tags: BTreeMap<TagName, Version>,
}

impl PackageMetadata {
    /// Empty metadata for a package with no versions yet.
    pub fn new(identity: PackageIdentity, description: impl Into<String>) -> Self {
        Self {
            identity,
            description: description.into(),
            versions: Vec::new(),
            dist_tags: BTreeMap::new(),
        }
    }

    /// Look up a specific version.
    pub fn find(&self, version: &Version) -> Option<&PackageVersion> {
        self.versions.iter().find(|v| &v.version == version)
    }

    /// Mutable lookup of a specific version.
    pub fn find_mut(&mut self, version: &Version) -> Option<&mut PackageVersion> {
        self.versions.iter_mut().find(|v| &v.version == version)
    }

    /// Highest non-yanked version.
    pub fn latest(&self) -> Option<&PackageVersion> {
        self.versions
            .iter()
            .filter(|v| !v.yanked)
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Rebuild per-version tag membership from the dist-tag table.
    pub fn sync_tag_memberships(&mut self) {
        for record in &mut self.versions {
            record.tags = self
                .dist_tags
                .iter()
                .filter(|(_, v)| **v == record.version)
                .map(|(t, _)| t.clone())
                .collect();
        }
    }

    /// Condensed form for search results.
    pub fn summary(&self) -> PackageSummary {
        PackageSummary {
            identity: self.identity.clone(),
            description: self.description.clone(),
            latest: self
                .dist_tags
                .get(&TagName::latest())
                .cloned()
                .or_else(|| self.latest().map(|v| v.version.clone())),
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    /// Package identity.
    pub identity: PackageIdentity,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Current `latest` version, if any.
    #[serde(default)]
    pub latest: Option<Version>,
}

/// Which trust model produced a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMethod {
    /// Traditional key-based signing with a registered Ed25519 key.
    Ed25519,
    /// Identity-based keyless signing anchored to a transparency log.
    Keyless,
    /// Any method this build does not recognize; treated as unsigned.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for SignatureMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ed25519 => "ed25519",
            Self::Keyless => "keyless",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// The identity a keyless signature was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerIdentity {
    /// Subject (e-mail address or workload URI).
    pub subject: String,
    /// Identity provider that vouched for the subject.
    pub issuer: String,
}

impl std::fmt::Display for SignerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.subject, self.issuer)
    }
}

/// Inclusion record from a transparency log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransparencyLogEntry {
    /// Identifier of the log that accepted the entry.
    pub log_id: String,
    /// Position of the entry in the log.
    pub log_index: u64,
    /// Unix time the entry was integrated.
    pub integrated_time: i64,
    /// Log's signature over the canonical entry payload (base64).
    pub signed_entry_timestamp: String,
}

/// A publisher signature attached to a [`PackageVersion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Trust model.
    pub method: SignatureMethod,
    /// Signature over the archive bytes (base64).
    pub signature: String,
    /// Registered key name (key-based signing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Ephemeral public key (keyless signing, base64).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Signer identity (keyless signing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<SignerIdentity>,
    /// Transparency-log inclusion record (keyless signing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_entry: Option<TransparencyLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, yanked: bool) -> PackageVersion {
        PackageVersion {
            identity: "demo".parse().unwrap(),
            version: version.parse().unwrap(),
            checksum: Sha256Digest::from_bytes([1; 32]),
            size: 10,
            dependencies: BTreeMap::new(),
            yanked,
            tags: BTreeSet::new(),
            signature: None,
            published_at: None,
        }
    }

    #[test]
    fn latest_skips_yanked() {
        let mut meta = PackageMetadata::new("demo".parse().unwrap(), "");
        meta.versions = vec![record("1.0.0", false), record("2.0.0", true)];
        assert_eq!(meta.latest().unwrap().version.to_string(), "1.0.0");
    }

    #[test]
    fn tag_memberships_follow_table() {
        let mut meta = PackageMetadata::new("demo".parse().unwrap(), "");
        meta.versions = vec![record("1.0.0", false), record("1.1.0", false)];
        meta.dist_tags
            .insert(TagName::latest(), "1.1.0".parse().unwrap());
        meta.dist_tags
            .insert(TagName::new("stable").unwrap(), "1.0.0".parse().unwrap());
        meta.sync_tag_memberships();
        assert!(meta.versions[1].has_tag(&TagName::latest()));
        assert!(!meta.versions[0].has_tag(&TagName::latest()));
        assert!(meta.versions[0].has_tag(&TagName::new("stable").unwrap()));
    }

    #[test]
    fn unknown_signature_method_deserializes() {
        let json = r#"{"method":"pgp","signature":"AAAA"}"#;
        let rec: SignatureRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.method, SignatureMethod::Unknown);
    }
}
