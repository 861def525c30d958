//! Virtual source: artifacts discovered in an ordinary git repository.
//!
//! Any directory holding a `plinth.toml` becomes a package. The repository has
//! no release process, so every artifact has exactly one version: the commit
//! currently checked out, written as `0.0.0+<commit>`. Archives are packed on
//! demand from the working tree.

use async_trait::async_trait;
use plinth_schema::{
    MANIFEST_FILE, Manifest, PackageIdentity, PackageMetadata, PackageSummary, PackageVersion,
    ResolvedSet, TagName, Version,
};
use semver::{BuildMetadata, Prerelease};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use walkdir::WalkDir;

use super::{ArchiveHandle, GitCheckout, Registry};
use crate::archive::{self, ArchiveLimits};
use crate::error::{Error, Result};
use crate::verify::checksum;

/// The version every artifact gets at `revision`.
///
/// # Errors
///
/// Returns [`Error::Git`] if the revision is not a valid build identifier.
pub fn revision_version(revision: &str) -> Result<Version> {
    let build = BuildMetadata::new(revision)
        .map_err(|e| Error::Git(format!("revision '{revision}' is not usable as a version: {e}")))?;
    Ok(Version {
        major: 0,
        minor: 0,
        patch: 0,
        pre: Prerelease::EMPTY,
        build,
    })
}

/// An installed artifact whose upstream has moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedArtifact {
    /// The installed artifact.
    pub identity: PackageIdentity,
    /// Commit it was installed from.
    pub installed: String,
    /// Current head of the upstream branch.
    pub upstream: String,
}

#[derive(Debug, Clone)]
struct Discovered {
    dir: PathBuf,
    description: String,
    record: PackageVersion,
}

#[derive(Debug)]
struct Snapshot {
    revision: String,
    artifacts: BTreeMap<PackageIdentity, Discovered>,
}

/// Read-only registry over the manifests found in a git checkout.
#[derive(Debug)]
pub struct VirtualSource {
    name: String,
    checkout: GitCheckout,
    limits: ArchiveLimits,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl VirtualSource {
    /// Source called `name` serving the artifacts in `checkout`.
    pub fn new(name: impl Into<String>, checkout: GitCheckout) -> Self {
        Self {
            name: name.into(),
            checkout,
            limits: ArchiveLimits::default(),
            snapshot: RwLock::new(None),
        }
    }

    /// Override the size limits applied when packing artifacts.
    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }

    async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }
        let mut slot = self.snapshot.write().await;
        if let Some(snapshot) = slot.as_ref() {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = Arc::new(self.index().await?);
        *slot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    async fn index(&self) -> Result<Snapshot> {
        let revision = self.checkout.head().await?;
        let root = self.checkout.dir().to_path_buf();
        let limits = self.limits;
        let snapshot = tokio::task::spawn_blocking(move || discover(&root, revision, limits))
            .await
            .map_err(|e| Error::context("indexing virtual source", e))??;
        tracing::debug!(
            source = %self.name,
            revision = %snapshot.revision,
            artifacts = snapshot.artifacts.len(),
            "indexed"
        );
        Ok(snapshot)
    }

    /// Pull the upstream branch and re-index. Returns the new revision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] if the pull fails.
    pub async fn update(&self) -> Result<String> {
        let mut slot = self.snapshot.write().await;
        self.checkout.update().await?;
        let snapshot = self.index().await?;
        let revision = snapshot.revision.clone();
        *slot = Some(Arc::new(snapshot));
        Ok(revision)
    }

    /// Revision currently served.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] if the checkout cannot be read.
    pub async fn revision(&self) -> Result<String> {
        Ok(self.snapshot().await?.revision.clone())
    }

    /// Installed packages from this source whose revision differs from the
    /// upstream branch head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] if the upstream cannot be listed.
    pub async fn outdated(&self, installed: &ResolvedSet) -> Result<Vec<OutdatedArtifact>> {
        let upstream = self.checkout.remote_head().await?;
        Ok(installed
            .iter()
            .filter(|pkg| pkg.source == self.name)
            .filter(|pkg| pkg.version.build.as_str() != upstream)
            .map(|pkg| OutdatedArtifact {
                identity: pkg.identity.clone(),
                installed: pkg.version.build.to_string(),
                upstream: upstream.clone(),
            })
            .collect())
    }

    fn metadata(artifact: &Discovered) -> PackageMetadata {
        let mut meta = PackageMetadata::new(artifact.record.identity.clone(), artifact.description.clone());
        meta.versions.push(artifact.record.clone());
        meta.dist_tags
            .insert(TagName::latest(), artifact.record.version.clone());
        meta
    }
}

fn discover(root: &Path, revision: String, limits: ArchiveLimits) -> Result<Snapshot> {
    let version = revision_version(&revision)?;
    let mut artifacts: BTreeMap<PackageIdentity, Discovered> = BTreeMap::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || entry.file_name() != MANIFEST_FILE {
            continue;
        }
        let text = std::fs::read_to_string(entry.path())?;
        let manifest = Manifest::from_toml_str(&text).map_err(|e| Error::InvalidManifest {
            path: entry.path().to_path_buf(),
            reason: e.to_string(),
        })?;
        let identity = manifest.package.name.clone();
        if let Some(existing) = artifacts.get(&identity) {
            return Err(Error::DuplicateArtifact {
                identity,
                first: existing.dir.clone(),
                second: entry.path().to_path_buf(),
            });
        }
        let dir = entry
            .path()
            .parent()
            .map_or_else(|| root.to_path_buf(), Path::to_path_buf);
        let bytes = archive::pack_dir(&dir)?;
        archive::inspect(&bytes, limits)?;
        let record = PackageVersion {
            identity: identity.clone(),
            version: version.clone(),
            checksum: checksum(&bytes),
            size: bytes.len() as u64,
            dependencies: manifest.dependencies,
            yanked: false,
            tags: BTreeSet::from([TagName::latest()]),
            signature: None,
            published_at: None,
        };
        artifacts.insert(
            identity,
            Discovered {
                dir,
                description: manifest.package.description,
                record,
            },
        );
    }
    Ok(Snapshot {
        revision,
        artifacts,
    })
}

#[async_trait]
impl Registry for VirtualSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str) -> Result<Vec<PackageSummary>> {
        let needle = query.to_lowercase();
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .artifacts
            .values()
            .filter(|a| {
                needle.is_empty()
                    || a.record.identity.to_string().contains(&needle)
                    || a.description.to_lowercase().contains(&needle)
            })
            .map(|a| Self::metadata(a).summary())
            .collect())
    }

    async fn get_metadata(&self, identity: &PackageIdentity) -> Result<PackageMetadata> {
        let snapshot = self.snapshot().await?;
        snapshot
            .artifacts
            .get(identity)
            .map(Self::metadata)
            .ok_or_else(|| Error::not_found(format!("artifact {identity} in '{}'", self.name)))
    }

    async fn fetch_archive(
        &self,
        identity: &PackageIdentity,
        version: &Version,
        dest: &Path,
    ) -> Result<ArchiveHandle> {
        let snapshot = self.snapshot().await?;
        let artifact = snapshot
            .artifacts
            .get(identity)
            .filter(|a| a.record.version == *version)
            .ok_or_else(|| {
                Error::not_found(format!("artifact {identity}@{version} in '{}'", self.name))
            })?;
        let dir = artifact.dir.clone();
        let bytes = tokio::task::spawn_blocking(move || archive::pack_dir(&dir))
            .await
            .map_err(|e| Error::context("packing artifact", e))??;
        tokio::fs::write(dest, &bytes).await?;
        Ok(ArchiveHandle {
            identity: identity.clone(),
            version: version.clone(),
            path: dest.to_path_buf(),
            size: bytes.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::git::test_support::commit_all;
    use plinth_schema::ResolvedPackage;
    use std::fs;

    fn write_artifact(repo: &Path, dir: &str, name: &str, deps: &str) {
        let path = repo.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join(MANIFEST_FILE),
            format!("[package]\nname = \"{name}\"\nversion = \"1.0.0\"\n\n[dependencies]\n{deps}\n"),
        )
        .unwrap();
        fs::write(path.join("README.md"), name).unwrap();
    }

    fn source(upstream: &Path, home: &Path) -> VirtualSource {
        let url = format!("file://{}", upstream.display());
        VirtualSource::new("skills", GitCheckout::new(url, "main", home.join("skills")))
    }

    #[test]
    fn malformed_manifests_fail_indexing() {
        let repo = tempfile::tempdir().unwrap();
        write_artifact(repo.path(), "good", "good", "");
        fs::create_dir_all(repo.path().join("broken")).unwrap();
        fs::write(repo.path().join("broken").join(MANIFEST_FILE), "[package\nname = ").unwrap();

        let err = discover(repo.path(), "abc123".into(), ArchiveLimits::default()).unwrap_err();
        assert!(
            matches!(&err, Error::InvalidManifest { path, .. } if path.starts_with(repo.path().join("broken"))),
            "unexpected {err}"
        );
    }

    #[test]
    fn duplicate_artifact_names_fail_indexing() {
        let repo = tempfile::tempdir().unwrap();
        write_artifact(repo.path(), "a/review", "review", "");
        write_artifact(repo.path(), "b/review", "review", "");

        let err = discover(repo.path(), "abc123".into(), ArchiveLimits::default()).unwrap_err();
        let Error::DuplicateArtifact { identity, first, second } = &err else {
            panic!("expected a duplicate, got {err}");
        };
        assert_eq!(identity.to_string(), "review");
        assert!(first.ends_with("a/review"));
        assert!(second.ends_with(Path::new("b/review").join(MANIFEST_FILE)));
    }

    #[test]
    fn revision_versions_carry_the_commit() {
        let v = revision_version("3f2a9c1").unwrap();
        assert_eq!(v.to_string(), "0.0.0+3f2a9c1");
        assert!(revision_version("not a sha!").is_err());
    }

    #[tokio::test]
    async fn lists_one_version_per_artifact() {
        if which::which("git").is_err() {
            return;
        }
        let upstream = tempfile::tempdir().unwrap();
        write_artifact(upstream.path(), "skills/review", "review", "lint = \"*\"");
        write_artifact(upstream.path(), "skills/lint", "lint", "");
        let head = commit_all(upstream.path(), "init");

        let home = tempfile::tempdir().unwrap();
        let src = source(upstream.path(), home.path());
        let review: PackageIdentity = "review".parse().unwrap();

        let versions = src.list_versions(&review, true).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, revision_version(&head).unwrap());
        assert_eq!(versions[0].dependencies.len(), 1);
        assert_eq!(src.search("").await.unwrap().len(), 2);

        let dest = home.path().join("review.tar.gz");
        let handle = src
            .fetch_archive(&review, &versions[0].version, &dest)
            .await
            .unwrap();
        let bytes = fs::read(&handle.path).unwrap();
        assert_eq!(checksum(&bytes), versions[0].checksum);
        let manifest = archive::inspect(&bytes, ArchiveLimits::default()).unwrap();
        assert_eq!(manifest.package.name, review);
    }

    #[tokio::test]
    async fn outdated_compares_against_upstream_head() {
        if which::which("git").is_err() {
            return;
        }
        let upstream = tempfile::tempdir().unwrap();
        write_artifact(upstream.path(), "lint", "lint", "");
        let first = commit_all(upstream.path(), "init");

        let home = tempfile::tempdir().unwrap();
        let src = source(upstream.path(), home.path());
        let lint: PackageIdentity = "lint".parse().unwrap();
        let record = src.list_versions(&lint, false).await.unwrap().remove(0);

        let installed: ResolvedSet = [ResolvedPackage {
            identity: lint.clone(),
            version: record.version.clone(),
            source: "skills".into(),
            checksum: record.checksum.clone(),
            size: record.size,
            dependencies: BTreeMap::new(),
        }]
        .into_iter()
        .collect();
        assert!(src.outdated(&installed).await.unwrap().is_empty());

        fs::write(upstream.path().join("lint/README.md"), "changed").unwrap();
        let second = commit_all(upstream.path(), "edit");
        let outdated = src.outdated(&installed).await.unwrap();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].installed, first);
        assert_eq!(outdated[0].upstream, second);

        assert_eq!(src.update().await.unwrap(), second);
        assert_eq!(src.revision().await.unwrap(), second);
    }
}
