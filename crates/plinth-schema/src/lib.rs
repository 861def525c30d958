//! Shared types and file formats for plinth.
//!
//! Everything here is free of I/O: identities, the version model, dist-tags,
//! digests, registry records, the manifest and lock file documents, and the
//! trust policy configuration. The engine in `plinth-core` builds on these.

pub mod error;
pub mod hash;
pub mod identity;
pub mod lock;
pub mod manifest;
pub mod package;
pub mod policy;
pub mod resolved;
pub mod tag;
pub mod version;

// Re-exports
pub use error::ParseError;
pub use hash::Sha256Digest;
pub use identity::PackageIdentity;
pub use lock::{LOCK_FILE, LockEntry, LockFile};
pub use manifest::{MANIFEST_FILE, Manifest, ManifestPackage, ManifestTrust};
pub use package::{
    PackageMetadata, PackageSummary, PackageVersion, SignatureMethod, SignatureRecord,
    SignerIdentity, TransparencyLogEntry,
};
pub use policy::{SignatureFailureMode, TrustPolicy, TrustStore, TrustedSigner};
pub use resolved::{ResolvedPackage, ResolvedSet};
pub use tag::{DependencySpec, DistTag, TagName};
pub use version::{Version, VersionConstraint};
