//! Engine error taxonomy.
//!
//! Every fallible operation in this crate returns [`Error`]. Callers branch on
//! the variant (or on [`Error::is_transient`] / [`Error::is_not_found`]) rather
//! than on message text.

use plinth_schema::{DependencySpec, PackageIdentity, ParseError, Sha256Digest, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::verify::PolicyViolation;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong in the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed identity, version, constraint, tag, digest, or document.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A source does not have the thing asked for.
    #[error("{what} not found")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Two requirements on one identity that no single version satisfies.
    #[error("{0}")]
    Conflict(Box<Conflict>),

    /// No source offers an eligible version.
    #[error("cannot resolve {identity} {spec}: {reason}")]
    Unresolvable {
        /// The package asked for.
        identity: PackageIdentity,
        /// What was asked for.
        spec: DependencySpec,
        /// Why nothing qualified.
        reason: String,
    },

    /// The trust policy rejected a candidate.
    #[error("{identity}@{version} blocked by trust policy: {violation}")]
    PolicyBlocked {
        /// Rejected package.
        identity: PackageIdentity,
        /// Rejected version.
        version: Version,
        /// The rule that failed.
        violation: PolicyViolation,
    },

    /// An operation ran past its deadline.
    #[error("{operation} timed out after {}s", after.as_secs_f64())]
    Timeout {
        /// What was running.
        operation: String,
        /// The deadline that expired.
        after: Duration,
    },

    /// Fetched bytes do not hash to the recorded checksum.
    #[error("checksum mismatch for {identity}@{version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Package fetched.
        identity: PackageIdentity,
        /// Version fetched.
        version: Version,
        /// Recorded digest.
        expected: Sha256Digest,
        /// Digest of the bytes received.
        actual: Sha256Digest,
    },

    /// A signature is present but does not verify or is not trusted.
    #[error("invalid signature on {identity}@{version}: {reason}")]
    SignatureInvalid {
        /// Signed package.
        identity: PackageIdentity,
        /// Signed version.
        version: Version,
        /// Verifier's explanation.
        reason: String,
    },

    /// A backend answered with a structured error.
    #[error("registry '{registry}' returned {status} ({code}): {message}")]
    Registry {
        /// Backend name.
        registry: String,
        /// Structured code.
        code: ErrorCode,
        /// HTTP status, or the status the code maps to for local backends.
        status: u16,
        /// Backend-supplied detail.
        message: String,
    },

    /// Transport failure talking to a remote registry.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed, oversized, or unsafe archive.
    #[error("archive error: {0}")]
    Archive(String),

    /// A package manifest found on disk does not parse.
    #[error("invalid manifest {}: {reason}", path.display())]
    InvalidManifest {
        /// Manifest file.
        path: PathBuf,
        /// Parser's explanation.
        reason: String,
    },

    /// A registry index file does not parse.
    #[error("invalid package index {}: {reason}", path.display())]
    InvalidIndex {
        /// Index file.
        path: PathBuf,
        /// Parser's explanation.
        reason: String,
    },

    /// Two artifacts in one source claim the same identity.
    #[error("{identity} is declared twice: {} and {}", first.display(), second.display())]
    DuplicateArtifact {
        /// The contested identity.
        identity: PackageIdentity,
        /// Directory of the artifact indexed first.
        first: PathBuf,
        /// Manifest of the second claimant.
        second: PathBuf,
    },

    /// A git command failed.
    #[error("git error: {0}")]
    Git(String),

    /// The backend is read-only or lacks the operation.
    #[error("registry '{registry}' does not support {operation}")]
    Unsupported {
        /// Backend name.
        registry: String,
        /// Operation attempted.
        operation: &'static str,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse failure.
    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization failure.
    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// JSON failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else, with a short context label.
    #[error("{context}: {message}")]
    Context {
        /// Where it happened.
        context: &'static str,
        /// What happened.
        message: String,
    },
}

impl Error {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound {
            what: what.to_string(),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Registry { status, .. } => *status >= 500,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether this error means "this source does not have it".
    ///
    /// Resolution moves on to the next source only for these.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Registry { code, .. } => matches!(
                code,
                ErrorCode::PackageNotFound | ErrorCode::VersionNotFound | ErrorCode::TagNotFound
            ),
            _ => false,
        }
    }
}

/// Structured error codes shared by every backend and the HTTP contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No such package.
    PackageNotFound,
    /// The package exists but not at that version.
    VersionNotFound,
    /// The package has no such dist-tag.
    TagNotFound,
    /// Publishing a version that already exists.
    VersionExists,
    /// Uploaded bytes do not match the declared checksum.
    ChecksumMismatch,
    /// Uploaded signature does not verify.
    SignatureInvalid,
    /// Missing or bad credentials.
    Unauthorized,
    /// Credentials lack permission.
    Forbidden,
    /// Too many requests. Not retried.
    RateLimited,
    /// Malformed request.
    InvalidRequest,
    /// Server-side failure.
    Internal,
    /// A code this build does not know.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Best-effort code for a response that carried no structured body.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::InvalidRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::PackageNotFound,
            409 => Self::VersionExists,
            429 => Self::RateLimited,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }

    /// HTTP status a server should send for this code.
    pub fn status(self) -> u16 {
        match self {
            Self::PackageNotFound | Self::VersionNotFound | Self::TagNotFound => 404,
            Self::VersionExists => 409,
            Self::ChecksumMismatch | Self::SignatureInvalid | Self::InvalidRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::RateLimited => 429,
            Self::Internal | Self::Unknown => 500,
        }
    }

    /// Wire spelling of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PackageNotFound => "package_not_found",
            Self::VersionNotFound => "version_not_found",
            Self::TagNotFound => "tag_not_found",
            Self::VersionExists => "version_exists",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::SignatureInvalid => "signature_invalid",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a package during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirer {
    /// The install request itself.
    Root,
    /// A resolved package's declared dependency.
    Package(PackageIdentity, Version),
}

impl fmt::Display for Requirer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("the install request"),
            Self::Package(id, v) => write!(f, "{id}@{v}"),
        }
    }
}

/// Two requirements on the same identity that cannot both hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// The contested identity.
    pub identity: PackageIdentity,
    /// Version fixed by the first requirement.
    pub resolved: Version,
    /// Who fixed it.
    pub first_requirer: Requirer,
    /// What they asked for.
    pub first_spec: DependencySpec,
    /// Who asked for something incompatible.
    pub second_requirer: Requirer,
    /// What they asked for.
    pub second_spec: DependencySpec,
}

impl Conflict {
    /// Human-readable hint for unblocking the install.
    pub fn suggestion(&self) -> String {
        format!(
            "relax the requirement from {} or {} so both accept a single version of {}",
            self.first_requirer, self.second_requirer, self.identity
        )
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version conflict on {}: {} requires {} (resolved {}), but {} requires {}; {}",
            self.identity,
            self.first_requirer,
            self.first_spec,
            self.resolved,
            self.second_requirer,
            self.second_spec,
            self.suggestion()
        )
    }
}
