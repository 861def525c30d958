//! Registry backends.
//!
//! A registry answers metadata queries and hands out archive bytes. It never
//! verifies what it serves; checksum, signature, and policy checks all happen
//! in the engine. Backends are consulted in configured precedence order.

mod git;
mod local;
mod remote;
mod virtual_source;

pub use git::{GitCheckout, GitRegistry};
pub use local::LocalRegistry;
pub use remote::{CHECKSUM_HEADER, RemoteOptions, RemoteRegistry, SIGNATURE_HEADER, TAG_HEADER};
pub use virtual_source::{OutdatedArtifact, VirtualSource, revision_version};

use async_trait::async_trait;
use plinth_schema::{
    PackageIdentity, PackageMetadata, PackageSummary, PackageVersion, SignatureRecord, TagName,
    Version,
};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// An archive a backend wrote to the requested destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHandle {
    /// Package fetched.
    pub identity: PackageIdentity,
    /// Version fetched.
    pub version: Version,
    /// Where the bytes were written.
    pub path: PathBuf,
    /// Number of bytes written.
    pub size: u64,
}

/// A publish: archive bytes plus the publisher's extras.
///
/// Package metadata (identity, version, dependencies) comes from the
/// manifest inside the archive.
#[derive(Clone)]
pub struct PublishRequest {
    /// Gzipped tarball with a manifest at its root.
    pub archive: Vec<u8>,
    /// Dist-tag to point at the new version; `latest` when unset.
    pub tag: Option<TagName>,
    /// Publisher signature over `archive`.
    pub signature: Option<SignatureRecord>,
}

impl PublishRequest {
    /// Publish `archive` under `latest`, unsigned.
    pub fn new(archive: Vec<u8>) -> Self {
        Self {
            archive,
            tag: None,
            signature: None,
        }
    }

    /// Point `tag` at the new version instead of `latest`.
    pub fn with_tag(mut self, tag: TagName) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Attach a publisher signature.
    pub fn with_signature(mut self, signature: SignatureRecord) -> Self {
        self.signature = Some(signature);
        self
    }
}

impl fmt::Debug for PublishRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishRequest")
            .field("archive_bytes", &self.archive.len())
            .field("tag", &self.tag)
            .field("signed", &self.signature.is_some())
            .finish()
    }
}

/// A source of packages.
///
/// Read operations are required. Owner mutations default to
/// [`Error::Unsupported`] for read-only backends.
#[async_trait]
pub trait Registry: Send + Sync + fmt::Debug {
    /// Name used in configuration, lock files, and diagnostics.
    fn name(&self) -> &str;

    /// Packages whose identity or description mention `query`.
    ///
    /// # Errors
    ///
    /// Backend or transport failures.
    async fn search(&self, query: &str) -> Result<Vec<PackageSummary>>;

    /// Everything known about one package.
    ///
    /// # Errors
    ///
    /// A not-found error (see [`Error::is_not_found`]) when the backend does
    /// not have the package, or a backend failure.
    async fn get_metadata(&self, identity: &PackageIdentity) -> Result<PackageMetadata>;

    /// Published versions, optionally including yanked ones.
    ///
    /// # Errors
    ///
    /// As [`Registry::get_metadata`].
    async fn list_versions(
        &self,
        identity: &PackageIdentity,
        include_yanked: bool,
    ) -> Result<Vec<PackageVersion>> {
        let meta = self.get_metadata(identity).await?;
        Ok(meta
            .versions
            .into_iter()
            .filter(|v| include_yanked || !v.yanked)
            .collect())
    }

    /// The version a dist-tag currently points at.
    ///
    /// # Errors
    ///
    /// A not-found error when the package or the tag is missing.
    async fn resolve_tag(&self, identity: &PackageIdentity, tag: &TagName) -> Result<Version> {
        let meta = self.get_metadata(identity).await?;
        meta.dist_tags
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("tag '{tag}' of {identity}")))
    }

    /// Write the archive for `identity@version` to `dest`.
    ///
    /// # Errors
    ///
    /// A not-found error when the version is missing, or a transfer failure.
    async fn fetch_archive(
        &self,
        identity: &PackageIdentity,
        version: &Version,
        dest: &std::path::Path,
    ) -> Result<ArchiveHandle>;

    /// Publish a new version.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] on read-only backends; `version_exists` when the
    /// version is already published.
    async fn publish(&self, _request: PublishRequest) -> Result<PackageVersion> {
        Err(self.unsupported("publish"))
    }

    /// Point a dist-tag at an existing version.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] on read-only backends, or the version is missing.
    async fn set_tag(
        &self,
        _identity: &PackageIdentity,
        _tag: &TagName,
        _version: &Version,
    ) -> Result<()> {
        Err(self.unsupported("set_tag"))
    }

    /// Delete a dist-tag.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] on read-only backends, or the tag is missing or
    /// is `latest`.
    async fn remove_tag(&self, _identity: &PackageIdentity, _tag: &TagName) -> Result<()> {
        Err(self.unsupported("remove_tag"))
    }

    /// Mark or unmark a version as yanked.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] on read-only backends, or the version is missing.
    async fn yank(&self, _identity: &PackageIdentity, _version: &Version, _yanked: bool) -> Result<()> {
        Err(self.unsupported("yank"))
    }

    /// The error read-only backends return for mutations.
    fn unsupported(&self, operation: &'static str) -> Error {
        Error::Unsupported {
            registry: self.name().to_string(),
            operation,
        }
    }
}
