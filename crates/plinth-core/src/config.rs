//! Engine configuration.
//!
//! ```toml
//! concurrency = 8
//!
//! [[backend]]
//! kind = "remote"
//! name = "public"
//! url = "https://registry.example.com"
//! token_env = "PLINTH_TOKEN"
//!
//! [[backend]]
//! kind = "git"
//! name = "team"
//! url = "https://git.example.com/team/registry.git"
//!
//! [trust]
//! allowed_scopes = ["@team", "@"]
//! ```

use plinth_schema::{TrustPolicy, TrustStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::archive::{ArchiveLimits, DEFAULT_MAX_UNCOMPRESSED_BYTES};
use crate::error::{Error, Result};
use crate::paths::{plinth_home, source_checkout_path};
use crate::registry::{
    GitCheckout, GitRegistry, LocalRegistry, Registry, RemoteOptions, RemoteRegistry,
    VirtualSource,
};

/// Name of the install cache in precedence lists and lock entries.
pub const CACHE_REGISTRY: &str = "cache";

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root for the cache and source checkouts. Defaults to `$PLINTH_HOME`
    /// or `~/.plinth`.
    pub home: Option<PathBuf>,
    /// Concurrent registry lookups and archive fetches.
    pub concurrency: usize,
    /// Deadline for one whole resolution.
    pub resolution_timeout_secs: u64,
    /// Maximum uncompressed archive size.
    pub max_archive_bytes: u64,
    /// Backends in precedence order.
    #[serde(rename = "backend")]
    pub backends: Vec<BackendConfig>,
    /// Admission rules applied during resolution and after fetch.
    pub trust: TrustPolicy,
    /// Keys and signers signatures are checked against.
    pub trust_store: TrustStore,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home: None,
            concurrency: crate::resolver::DEFAULT_CONCURRENCY,
            resolution_timeout_secs: crate::resolver::DEFAULT_DEADLINE.as_secs(),
            max_archive_bytes: DEFAULT_MAX_UNCOMPRESSED_BYTES,
            backends: Vec::new(),
            trust: TrustPolicy::default(),
            trust_store: TrustStore::default(),
        }
    }
}

/// One configured registry backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// A registry directory on disk.
    Local {
        /// Unique backend name.
        name: String,
        /// Registry root.
        path: PathBuf,
    },
    /// A registry layout inside a git repository.
    Git {
        /// Unique backend name.
        name: String,
        /// Clone URL.
        url: String,
        /// Branch to track.
        #[serde(default = "default_branch")]
        branch: String,
        /// Directory inside the repository holding the registry layout.
        #[serde(default = "default_subtree")]
        subtree: PathBuf,
    },
    /// An HTTP registry.
    Remote {
        /// Unique backend name.
        name: String,
        /// Base URL, without `/api/v1`.
        url: String,
        /// Bearer token. Prefer `token_env` outside of tests.
        #[serde(default)]
        token: Option<String>,
        /// Environment variable holding the bearer token.
        #[serde(default)]
        token_env: Option<String>,
        /// Per-request timeout.
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        /// Retries after the first attempt, for transient failures only.
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
    /// Every manifest in a source repository, versioned by commit.
    Virtual {
        /// Unique backend name.
        name: String,
        /// Clone URL.
        url: String,
        /// Branch to track.
        #[serde(default = "default_branch")]
        branch: String,
    },
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_subtree() -> PathBuf {
    PathBuf::from("packages")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl BackendConfig {
    /// The backend's name.
    pub fn name(&self) -> &str {
        match self {
            Self::Local { name, .. }
            | Self::Git { name, .. }
            | Self::Remote { name, .. }
            | Self::Virtual { name, .. } => name,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a configuration document.
    ///
    /// # Errors
    ///
    /// Returns a TOML error for malformed input and [`Error::Config`] for
    /// invalid values.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.resolution_timeout_secs == 0 {
            return Err(Error::Config("resolution_timeout_secs must be at least 1".to_string()));
        }
        let mut names = BTreeSet::from([CACHE_REGISTRY]);
        for backend in &self.backends {
            if !names.insert(backend.name()) {
                return Err(Error::Config(format!(
                    "backend name '{}' is used more than once",
                    backend.name()
                )));
            }
        }
        Ok(())
    }

    /// The configured home, or the default location.
    ///
    /// # Errors
    ///
    /// Fails if no home is configured and none can be determined.
    pub fn home_dir(&self) -> Result<PathBuf> {
        match &self.home {
            Some(home) => Ok(home.clone()),
            None => plinth_home(),
        }
    }

    /// Archive limits derived from `max_archive_bytes`.
    pub fn limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_uncompressed_bytes: self.max_archive_bytes,
        }
    }

    /// Deadline for one resolution.
    pub fn resolution_deadline(&self) -> Duration {
        Duration::from_secs(self.resolution_timeout_secs)
    }

    /// Instantiate the configured backends, in order, without the cache.
    ///
    /// # Errors
    ///
    /// Fails if a name is duplicated, no home can be determined, or a remote
    /// client cannot be built.
    pub fn build_sources(&self) -> Result<Vec<Arc<dyn Registry>>> {
        self.validate()?;
        let home = self.home_dir()?;
        let limits = self.limits();
        self.backends
            .iter()
            .map(|backend| -> Result<Arc<dyn Registry>> {
                Ok(match backend {
                    BackendConfig::Local { name, path } => {
                        Arc::new(LocalRegistry::new(name.clone(), path.clone()).with_limits(limits))
                    }
                    BackendConfig::Git {
                        name,
                        url,
                        branch,
                        subtree,
                    } => {
                        let checkout =
                            GitCheckout::new(url.clone(), branch.clone(), source_checkout_path(&home, name));
                        Arc::new(GitRegistry::new(name.clone(), checkout, subtree))
                    }
                    BackendConfig::Remote {
                        name,
                        url,
                        token,
                        token_env,
                        timeout_secs,
                        max_retries,
                    } => {
                        let token = token
                            .clone()
                            .or_else(|| token_env.as_ref().and_then(|var| std::env::var(var).ok()));
                        let options = RemoteOptions {
                            timeout: Duration::from_secs(*timeout_secs),
                            max_retries: *max_retries,
                            token,
                            limits,
                            ..RemoteOptions::default()
                        };
                        Arc::new(RemoteRegistry::new(name.clone(), url, options)?)
                    }
                    BackendConfig::Virtual { name, url, branch } => {
                        let checkout =
                            GitCheckout::new(url.clone(), branch.clone(), source_checkout_path(&home, name));
                        Arc::new(VirtualSource::new(name.clone(), checkout).with_limits(limits))
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_schema::SignatureFailureMode;

    const FULL: &str = r#"
home = "/srv/plinth"
concurrency = 8

[[backend]]
kind = "local"
name = "vendored"
path = "/srv/registry"

[[backend]]
kind = "git"
name = "team"
url = "https://git.example.com/team/registry.git"

[[backend]]
kind = "remote"
name = "public"
url = "https://registry.example.com"
token = "secret"
max_retries = 1

[[backend]]
kind = "virtual"
name = "skills"
url = "https://git.example.com/team/skills.git"
branch = "release"

[trust]
allowed_scopes = ["@team"]
require_signature = true
on_signature_failure = "warn"

[trust_store.keys]
release = "MCowBQYDK2VwAyEA"
"#;

    #[test]
    fn parses_every_backend_kind() {
        let config = EngineConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.resolution_timeout_secs, 120);
        assert_eq!(config.max_archive_bytes, DEFAULT_MAX_UNCOMPRESSED_BYTES);
        assert_eq!(config.backends.len(), 4);
        assert!(matches!(
            &config.backends[1],
            BackendConfig::Git { branch, subtree, .. } if branch == "main" && subtree == Path::new("packages")
        ));
        assert!(matches!(
            &config.backends[2],
            BackendConfig::Remote { timeout_secs: 30, max_retries: 1, .. }
        ));
        assert!(matches!(&config.backends[3], BackendConfig::Virtual { branch, .. } if branch == "release"));
        assert!(config.trust.require_signature);
        assert_eq!(config.trust.on_signature_failure, SignatureFailureMode::Warn);
        assert!(config.trust_store.keys.contains_key("release"));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(EngineConfig::from_toml_str("concurrency = 0").is_err());
        assert!(EngineConfig::from_toml_str("colour = true").is_err());
        let duplicate = r#"
[[backend]]
kind = "local"
name = "cache"
path = "/tmp/x"
"#;
        assert!(matches!(EngineConfig::from_toml_str(duplicate), Err(Error::Config(_))));
        assert!(EngineConfig::from_toml_str("[[backend]]\nkind = \"ftp\"\nname = \"x\"").is_err());
    }

    #[test]
    fn builds_sources_in_precedence_order() {
        let home = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::from_toml_str(FULL).unwrap();
        config.home = Some(home.path().to_path_buf());
        let names: Vec<String> = config
            .build_sources()
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, ["vendored", "team", "public", "skills"]);
    }
}
