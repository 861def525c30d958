//! The output of resolution: one pinned version per identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hash::Sha256Digest;
use crate::identity::PackageIdentity;
use crate::version::Version;

/// One package chosen by resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    /// Package identity.
    pub identity: PackageIdentity,
    /// Selected version.
    pub version: Version,
    /// Name of the source the version was found in.
    pub source: String,
    /// Expected archive checksum.
    pub checksum: Sha256Digest,
    /// Expected archive size in bytes.
    pub size: u64,
    /// Versions chosen for each declared dependency.
    pub dependencies: BTreeMap<PackageIdentity, Version>,
}

/// The output of resolution: exactly one version per identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedSet(BTreeMap<PackageIdentity, ResolvedPackage>);

impl ResolvedSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a package unless its identity is already present.
    ///
    /// Returns `false` (and keeps the existing entry) when the identity was
    /// already resolved: the first writer wins.
    pub fn insert(&mut self, package: ResolvedPackage) -> bool {
        if self.0.contains_key(&package.identity) {
            return false;
        }
        self.0.insert(package.identity.clone(), package);
        true
    }

    /// Look up a resolved package.
    pub fn get(&self, identity: &PackageIdentity) -> Option<&ResolvedPackage> {
        self.0.get(identity)
    }

    /// Mutable lookup, used to fill in dependency versions after the fact.
    pub(crate) fn get_mut(&mut self, identity: &PackageIdentity) -> Option<&mut ResolvedPackage> {
        self.0.get_mut(identity)
    }

    /// Whether `identity` has been resolved.
    pub fn contains(&self, identity: &PackageIdentity) -> bool {
        self.0.contains_key(identity)
    }

    /// Number of resolved packages.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing has been resolved.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Packages in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedPackage> {
        self.0.values()
    }

    /// Fill in `dependencies` for every package from the versions now in the set.
    ///
    /// `declared` maps each package to the identities it declared.
    pub fn link_dependencies(&mut self, declared: &BTreeMap<PackageIdentity, Vec<PackageIdentity>>) {
        for (owner, deps) in declared {
            let versions: BTreeMap<PackageIdentity, Version> = deps
                .iter()
                .filter_map(|d| self.0.get(d).map(|p| (d.clone(), p.version.clone())))
                .collect();
            if let Some(pkg) = self.get_mut(owner) {
                pkg.dependencies = versions;
            }
        }
    }
}

impl FromIterator<ResolvedPackage> for ResolvedSet {
    fn from_iter<T: IntoIterator<Item = ResolvedPackage>>(iter: T) -> Self {
        let mut set = Self::new();
        for pkg in iter {
            set.insert(pkg);
        }
        set
    }
}

impl<'a> IntoIterator for &'a ResolvedSet {
    type Item = &'a ResolvedPackage;
    type IntoIter = std::collections::btree_map::Values<'a, PackageIdentity, ResolvedPackage>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.values()
    }
}
