//! Filesystem-backed registry.
//!
//! Layout: `<root>/<scope or _>/<name>/index.json` holds the package metadata
//! and `<version>.tar.gz` files sit next to it. The installed-artifact cache
//! is a `LocalRegistry` too.

use async_trait::async_trait;
use chrono::Utc;
use plinth_schema::{
    PackageIdentity, PackageMetadata, PackageSummary, PackageVersion, TagName, Version,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use super::{ArchiveHandle, PublishRequest, Registry};
use crate::archive::{self, ArchiveLimits};
use crate::config::CACHE_REGISTRY;
use crate::error::{Error, ErrorCode, Result};
use crate::io::write_atomic;
use crate::verify::checksum;

const INDEX_FILE: &str = "index.json";

/// Registry stored in a directory tree.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    name: String,
    root: PathBuf,
    limits: ArchiveLimits,
    /// Keep per-version tag memberships as stored instead of deriving them
    /// from the dist-tag table. Set for the install cache.
    frozen_memberships: bool,
    /// Serializes read-modify-write cycles on index files.
    write_lock: Arc<Mutex<()>>,
}

impl LocalRegistry {
    /// Registry called `name` rooted at `root`. The directory is created on
    /// first publish.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            limits: ArchiveLimits::default(),
            frozen_memberships: false,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The install cache rooted at `root`.
    ///
    /// The cache has no dist-tag table of its own, so tag requests fall
    /// through to upstream sources. Each admitted record keeps the tag
    /// memberships it had at its source when it was verified.
    pub fn install_cache(root: impl Into<PathBuf>) -> Self {
        Self {
            frozen_memberships: true,
            ..Self::new(CACHE_REGISTRY, root)
        }
    }

    /// Override the archive size limits used by `publish`.
    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Directory the registry lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dir(&self, identity: &PackageIdentity) -> PathBuf {
        self.root.join(identity.storage_dir())
    }

    fn index_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.package_dir(identity).join(INDEX_FILE)
    }

    /// Where the archive for `identity@version` lives.
    pub fn archive_path(&self, identity: &PackageIdentity, version: &Version) -> PathBuf {
        self.package_dir(identity).join(format!("{version}.tar.gz"))
    }

    /// Read a package's metadata, or [`Error::NotFound`].
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON error if the index exists but cannot be read.
    pub async fn load_metadata(&self, identity: &PackageIdentity) -> Result<PackageMetadata> {
        let path = self.index_path(identity);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("package {identity} in '{}'", self.name)));
            }
            Err(e) => return Err(e.into()),
        };
        let mut meta: PackageMetadata = serde_json::from_slice(&bytes)?;
        if !self.frozen_memberships {
            meta.sync_tag_memberships();
        }
        Ok(meta)
    }

    async fn save_metadata(&self, meta: &PackageMetadata) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.index_path(&meta.identity), &json).await
    }

    /// Whether the exact archive described by `record` is already stored.
    pub async fn has_archive(&self, record: &PackageVersion) -> bool {
        let Ok(meta) = self.load_metadata(&record.identity).await else {
            return false;
        };
        meta.find(&record.version)
            .is_some_and(|stored| stored.checksum == record.checksum)
            && fs::try_exists(self.archive_path(&record.identity, &record.version))
                .await
                .unwrap_or(false)
    }

    /// Move an already-verified archive into the store and record it.
    ///
    /// The archive lands before the index entry, so readers never see an
    /// entry whose bytes are missing. Dist-tags are not copied; the record's
    /// own tag memberships are.
    ///
    /// # Errors
    ///
    /// Fails if the rename or the index write fails.
    pub async fn store_verified(&self, record: &PackageVersion, staged: &Path) -> Result<PathBuf> {
        let _guard = self.write_lock.lock().await;
        let target = self.archive_path(&record.identity, &record.version);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staged, &target).await?;

        let mut meta = match self.load_metadata(&record.identity).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => PackageMetadata::new(record.identity.clone(), ""),
            Err(e) => return Err(e),
        };
        meta.versions.retain(|v| v.version != record.version);
        meta.versions.push(record.clone());
        meta.versions.sort_by(|a, b| a.version.cmp(&b.version));
        self.save_metadata(&meta).await?;
        Ok(target)
    }

    fn rejected(&self, code: ErrorCode, message: impl Into<String>) -> Error {
        Error::Registry {
            registry: self.name.clone(),
            code,
            status: code.status(),
            message: message.into(),
        }
    }

    async fn modify<F>(&self, identity: &PackageIdentity, change: F) -> Result<()>
    where
        F: FnOnce(&mut PackageMetadata) -> Result<()> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut meta = self.load_metadata(identity).await?;
        change(&mut meta)?;
        if !self.frozen_memberships {
            meta.sync_tag_memberships();
        }
        self.save_metadata(&meta).await
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str) -> Result<Vec<PackageSummary>> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(hits);
        }
        let mut indexes = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_name() == INDEX_FILE {
                indexes.push(entry.into_path());
            }
        }
        for path in indexes {
            let bytes = fs::read(&path).await?;
            let meta: PackageMetadata = serde_json::from_slice(&bytes).map_err(|e| Error::InvalidIndex {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if needle.is_empty()
                || meta.identity.to_string().contains(&needle)
                || meta.description.to_lowercase().contains(&needle)
            {
                hits.push(meta.summary());
            }
        }
        hits.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(hits)
    }

    async fn get_metadata(&self, identity: &PackageIdentity) -> Result<PackageMetadata> {
        self.load_metadata(identity).await
    }

    async fn fetch_archive(
        &self,
        identity: &PackageIdentity,
        version: &Version,
        dest: &Path,
    ) -> Result<ArchiveHandle> {
        let source = self.archive_path(identity, version);
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(Error::not_found(format!(
                "archive {identity}@{version} in '{}'",
                self.name
            )));
        }
        let size = fs::copy(&source, dest).await?;
        Ok(ArchiveHandle {
            identity: identity.clone(),
            version: version.clone(),
            path: dest.to_path_buf(),
            size,
        })
    }

    async fn publish(&self, request: PublishRequest) -> Result<PackageVersion> {
        if request.archive.len() as u64 > self.limits.max_uncompressed_bytes {
            return Err(self.rejected(ErrorCode::InvalidRequest, "archive is too large"));
        }
        let limits = self.limits;
        let PublishRequest {
            archive: bytes,
            tag,
            signature,
        } = request;
        let (manifest, bytes) = tokio::task::spawn_blocking(move || {
            archive::inspect(&bytes, limits).map(|manifest| (manifest, bytes))
        })
        .await
        .map_err(|e| Error::context("inspecting archive", e))?
        .map_err(|e| self.rejected(ErrorCode::InvalidRequest, e.to_string()))?;

        let identity = manifest.package.name.clone();
        let version = manifest.package.version.clone();
        let _guard = self.write_lock.lock().await;
        let mut meta = match self.load_metadata(&identity).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => {
                PackageMetadata::new(identity.clone(), manifest.package.description.clone())
            }
            Err(e) => return Err(e),
        };
        if meta.find(&version).is_some() {
            return Err(self.rejected(
                ErrorCode::VersionExists,
                format!("{identity}@{version} is already published"),
            ));
        }

        let record = PackageVersion {
            identity: identity.clone(),
            version: version.clone(),
            checksum: checksum(&bytes),
            size: bytes.len() as u64,
            dependencies: manifest.dependencies.clone(),
            yanked: false,
            tags: BTreeSet::new(),
            signature,
            published_at: Some(Utc::now()),
        };
        write_atomic(&self.archive_path(&identity, &version), &bytes).await?;

        if !manifest.package.description.is_empty() {
            meta.description = manifest.package.description;
        }
        meta.versions.push(record);
        meta.versions.sort_by(|a, b| a.version.cmp(&b.version));
        meta.dist_tags
            .insert(tag.unwrap_or_else(TagName::latest), version.clone());
        meta.sync_tag_memberships();
        self.save_metadata(&meta).await?;
        tracing::info!(registry = %self.name, %identity, %version, "published");

        meta.find(&version)
            .cloned()
            .ok_or_else(|| Error::context("publish", "record vanished after save"))
    }

    async fn set_tag(&self, identity: &PackageIdentity, tag: &TagName, version: &Version) -> Result<()> {
        let not_published = self.rejected(
            ErrorCode::VersionNotFound,
            format!("{identity}@{version} is not published"),
        );
        self.modify(identity, |meta| {
            if meta.find(version).is_none() {
                return Err(not_published);
            }
            meta.dist_tags.insert(tag.clone(), version.clone());
            Ok(())
        })
        .await
    }

    async fn remove_tag(&self, identity: &PackageIdentity, tag: &TagName) -> Result<()> {
        if *tag == TagName::latest() {
            return Err(self.rejected(ErrorCode::InvalidRequest, "the latest tag cannot be removed"));
        }
        let missing = self.rejected(ErrorCode::TagNotFound, format!("{identity} has no tag '{tag}'"));
        self.modify(identity, |meta| {
            meta.dist_tags.remove(tag).map(|_| ()).ok_or(missing)
        })
        .await
    }

    async fn yank(&self, identity: &PackageIdentity, version: &Version, yanked: bool) -> Result<()> {
        let missing = self.rejected(
            ErrorCode::VersionNotFound,
            format!("{identity}@{version} is not published"),
        );
        self.modify(identity, |meta| {
            let record = meta.find_mut(version).ok_or(missing)?;
            record.yanked = yanked;
            Ok(())
        })
        .await
    }
}
