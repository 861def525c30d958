//! Resolution and verification engine for plinth.
//!
//! Registries are consulted in precedence order, dependency graphs are
//! resolved deterministically, and every archive is checked (checksum,
//! signature, trust policy) before it reaches the install cache.

pub mod archive;
pub mod config;
pub mod error;
pub mod install;
pub mod lock;
pub mod paths;
pub mod registry;
pub mod reporter;
pub mod resolver;
pub mod verify;

mod io;

pub use config::{BackendConfig, EngineConfig};
pub use error::{Conflict, Error, ErrorCode, Requirer, Result};
pub use install::{ExtractedArtifact, InstallOptions, InstallReport, Installer, InstallerOptions};
pub use lock::{DriftChange, DriftReport};
pub use paths::*;
pub use registry::{ArchiveHandle, PublishRequest, Registry};
pub use reporter::{NullReporter, Reporter, TracingReporter};
pub use resolver::{Resolution, Resolver, ResolverOptions};

/// User Agent string for registry requests
pub const USER_AGENT: &str = concat!("plinth/", env!("CARGO_PKG_VERSION"));
