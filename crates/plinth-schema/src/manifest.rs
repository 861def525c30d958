//! Package manifest (`plinth.toml`).
//!
//! Every archive carries its manifest at the root. The manifest declares the
//! package identity, its version, the dependencies it needs, and the
//! sub-artifacts deployment adapters should place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::error::ParseError;
use crate::identity::PackageIdentity;
use crate::tag::DependencySpec;
use crate::version::Version;

/// File name of the manifest inside a package archive.
pub const MANIFEST_FILE: &str = "plinth.toml";

/// Top-level manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// The `[package]` table.
    pub package: ManifestPackage,
    /// Map of dependency identities to constraint or tag strings.
    #[serde(default)]
    pub dependencies: BTreeMap<PackageIdentity, DependencySpec>,
    /// Optional publisher trust hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<ManifestTrust>,
}

/// The `[package]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestPackage {
    /// Package identity.
    pub name: PackageIdentity,
    /// Package version.
    pub version: Version,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Sub-artifacts (paths relative to the archive root).
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// The `[trust]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestTrust {
    /// Expected signer subject for keyless signatures.
    #[serde(default)]
    pub signer: Option<String>,
    /// Expected signer issuer for keyless signatures.
    #[serde(default)]
    pub issuer: Option<String>,
}

impl Manifest {
    /// Parse and validate a manifest document.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Document`] if the TOML is malformed, a field
    /// fails its own grammar, or an artifact path escapes the package root.
    pub fn from_toml_str(content: &str) -> Result<Self, ParseError> {
        let manifest: Manifest = toml::from_str(content).map_err(|e| ParseError::Document {
            document: MANIFEST_FILE,
            reason: e.to_string(),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Document`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ParseError> {
        toml::to_string_pretty(self).map_err(|e| ParseError::Document {
            document: MANIFEST_FILE,
            reason: e.to_string(),
        })
    }

    /// Check cross-field rules serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Document`] describing the first violation.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.dependencies.contains_key(&self.package.name) {
            return Err(ParseError::Document {
                document: MANIFEST_FILE,
                reason: format!("{} depends on itself", self.package.name),
            });
        }
        for artifact in &self.package.artifacts {
            let path = Path::new(artifact);
            let escapes = path.is_absolute()
                || path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if artifact.is_empty() || escapes {
                return Err(ParseError::Document {
                    document: MANIFEST_FILE,
                    reason: format!("artifact path '{artifact}' must stay inside the package"),
                });
            }
        }
        Ok(())
    }
}
