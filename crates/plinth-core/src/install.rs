//! Install orchestration.
//!
//! `install` drives resolve, fetch, verify, and cache admission, then records
//! the result in the lock file. `materialize` lays cached archives out on disk
//! for an adapter. Nothing enters the cache until its checksum, signature, and
//! policy checks have passed; downloads are staged on the cache's volume and
//! renamed in.

use futures::{StreamExt, TryStreamExt};
use plinth_schema::{
    DependencySpec, LockFile, PackageIdentity, PackageVersion, ResolvedPackage, ResolvedSet,
    TrustPolicy, TrustStore, Version,
};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::archive::{self, ArchiveLimits};
use crate::config::{CACHE_REGISTRY, EngineConfig};
use crate::error::{Error, Result};
use crate::lock::{self, DriftReport};
use crate::paths::{cache_path, staging_path};
use crate::registry::{LocalRegistry, Registry};
use crate::reporter::{NullReporter, Reporter};
use crate::resolver::{DEFAULT_CONCURRENCY, DEFAULT_DEADLINE, Resolver, ResolverOptions};
use crate::verify::{
    CompiledPolicy, PolicyDecision, PolicyViolation, SignatureStatus, VerificationResult,
    check_declared_signer, checksum_file, verify_signature,
};

/// Per-call install settings.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Lock file to honor and rewrite. `None` leaves locking to the caller.
    pub lock_path: Option<PathBuf>,
    /// Install exactly what the lock file pins, skipping resolution.
    pub frozen: bool,
}

/// Tuning shared by every install an [`Installer`] runs.
#[derive(Debug, Clone, Copy)]
pub struct InstallerOptions {
    /// Concurrent registry lookups and archive fetches.
    pub concurrency: usize,
    /// Resolution deadline.
    pub deadline: Duration,
    /// Archive size limits.
    pub limits: ArchiveLimits,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            deadline: DEFAULT_DEADLINE,
            limits: ArchiveLimits::default(),
        }
    }
}

/// What an install did.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Packages now in the cache.
    pub set: ResolvedSet,
    /// Difference from the lock file that was on disk before, if any.
    pub drift: Option<DriftReport>,
    /// Policy findings that did not block the install.
    pub warnings: Vec<String>,
    /// Whether the set came from the lock file instead of resolution.
    pub from_lock: bool,
}

/// One package laid out by [`Installer::materialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedArtifact {
    /// Package identity.
    pub identity: PackageIdentity,
    /// Installed version.
    pub version: Version,
    /// Directory the archive was extracted into.
    pub root: PathBuf,
    /// Declared sub-artifacts, resolved against `root`.
    pub artifacts: Vec<PathBuf>,
}

/// Resolves, fetches, verifies, and caches packages for one home directory.
pub struct Installer {
    home: PathBuf,
    cache: Arc<LocalRegistry>,
    /// Cache first, then the configured sources.
    sources: Vec<Arc<dyn Registry>>,
    policy: Arc<CompiledPolicy>,
    trust_policy: TrustPolicy,
    trust_store: TrustStore,
    options: InstallerOptions,
    reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for Installer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Installer")
            .field("home", &self.home)
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Installer {
    /// Installer rooted at `home`, consulting its cache before `sources`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid policy pattern.
    pub fn new(
        home: impl Into<PathBuf>,
        sources: Vec<Arc<dyn Registry>>,
        policy: TrustPolicy,
        trust_store: TrustStore,
    ) -> Result<Self> {
        let home = home.into();
        let options = InstallerOptions::default();
        let cache = Arc::new(LocalRegistry::install_cache(cache_path(&home)).with_limits(options.limits));
        let mut all: Vec<Arc<dyn Registry>> = vec![cache.clone()];
        all.extend(sources);
        Ok(Self {
            home,
            cache,
            sources: all,
            policy: Arc::new(CompiledPolicy::new(&policy)?),
            trust_policy: policy,
            trust_store,
            options,
            reporter: Arc::new(NullReporter),
        })
    }

    /// Installer for a loaded configuration.
    ///
    /// # Errors
    ///
    /// Fails if the backends or the policy cannot be built.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let installer = Self::new(
            config.home_dir()?,
            config.build_sources()?,
            config.trust.clone(),
            config.trust_store.clone(),
        )?;
        Ok(installer.with_options(InstallerOptions {
            concurrency: config.concurrency,
            deadline: config.resolution_deadline(),
            limits: config.limits(),
        }))
    }

    /// Replace the tuning options. The cache picks up the new limits.
    pub fn with_options(mut self, options: InstallerOptions) -> Self {
        self.options = options;
        self.cache = Arc::new(LocalRegistry::install_cache(cache_path(&self.home)).with_limits(options.limits));
        self.sources[0] = self.cache.clone();
        self
    }

    /// Send progress to `reporter` instead of discarding it.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// The install cache.
    pub fn cache(&self) -> &LocalRegistry {
        &self.cache
    }

    fn resolver(&self) -> Result<Resolver> {
        Ok(Resolver::new(self.sources.clone(), &self.trust_policy)?.with_options(ResolverOptions {
            concurrency: self.options.concurrency,
            deadline: self.options.deadline,
        }))
    }

    /// Resolve, fetch, verify, and cache `identity@spec` and its dependencies.
    ///
    /// # Errors
    ///
    /// Any resolution error, [`Error::ChecksumMismatch`],
    /// [`Error::SignatureInvalid`], [`Error::PolicyBlocked`], or a fetch or
    /// archive failure. The cache only ever gains fully verified archives.
    pub async fn install(
        &self,
        identity: &PackageIdentity,
        spec: &DependencySpec,
        options: &InstallOptions,
    ) -> Result<InstallReport> {
        let started = Instant::now();
        let previous = match &options.lock_path {
            Some(path) => lock::load(path).await?,
            None => None,
        };

        let (set, records, mut warnings, from_lock) = match previous.as_ref().filter(|_| options.frozen) {
            Some(locked) => {
                self.reporter.section("Reading lock file");
                let set = frozen_set(locked, identity, spec)?;
                let records = self.locked_records(&set).await?;
                (set, records, Vec::new(), true)
            }
            None => {
                self.reporter.section("Resolving");
                let resolution = self.resolver()?.resolve(identity, spec).await?;
                (resolution.set, resolution.records, resolution.warnings, false)
            }
        };
        for warning in &warnings {
            self.reporter.warning(warning);
        }

        self.reporter.section("Fetching");
        tokio::fs::create_dir_all(staging_path(&self.home)).await?;
        let fetched: Vec<Vec<String>> = futures::stream::iter(set.iter())
            .map(|pkg| {
                let record = records.get(&pkg.identity);
                async move {
                    match record {
                        Some(record) => self.admit(pkg, record).await,
                        None => Err(Error::context("install", format!("no record for {}", pkg.identity))),
                    }
                }
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .try_collect()
            .await?;
        warnings.extend(fetched.into_iter().flatten());

        let drift = previous.as_ref().map(|old| lock::diff(old, &set));
        if let Some(drift) = drift.as_ref().filter(|d| !d.is_clean()) {
            tracing::warn!(%drift, "lock file drift");
        }
        if let (Some(path), false) = (&options.lock_path, from_lock) {
            let mut document = lock::write(&set);
            document.root = Some(identity.clone());
            lock::save(&document, path).await?;
        }

        self.reporter
            .summary(set.len(), "installed", started.elapsed().as_secs_f64());
        Ok(InstallReport {
            set,
            drift,
            warnings,
            from_lock,
        })
    }

    /// Registry records for a locked set, looked up in the named source first.
    async fn locked_records(&self, set: &ResolvedSet) -> Result<BTreeMap<PackageIdentity, PackageVersion>> {
        let mut records = BTreeMap::new();
        for pkg in set {
            let mut found = None;
            for registry in self.in_preference(&pkg.source) {
                match registry.list_versions(&pkg.identity, true).await {
                    Ok(versions) => {
                        found = versions.into_iter().find(|v| v.version == pkg.version);
                        if found.is_some() {
                            break;
                        }
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            let record = found.ok_or_else(|| {
                Error::not_found(format!("{}@{} in any source", pkg.identity, pkg.version))
            })?;
            records.insert(pkg.identity.clone(), record);
        }
        Ok(records)
    }

    /// Sources with `preferred` moved to the front.
    fn in_preference<'a>(&'a self, preferred: &'a str) -> impl Iterator<Item = &'a Arc<dyn Registry>> {
        let first = self.sources.iter().filter(move |s| s.name() == preferred);
        let rest = self.sources.iter().filter(move |s| s.name() != preferred);
        first.chain(rest)
    }

    /// Bring one package into the cache. Returns policy warnings.
    async fn admit(&self, pkg: &ResolvedPackage, record: &PackageVersion) -> Result<Vec<String>> {
        let mut wanted = record.clone();
        wanted.checksum = pkg.checksum.clone();
        if self.cache.has_archive(&wanted).await {
            self.reporter.done(&pkg.identity, &pkg.version, "cached");
            return Ok(Vec::new());
        }

        let staged = tempfile::NamedTempFile::new_in(staging_path(&self.home))?.into_temp_path();
        let source = self.fetch_into(pkg, &staged).await?;

        let (actual, _size) = checksum_file(&staged).await?;
        if actual != pkg.checksum {
            self.reporter.failed(&pkg.identity, &pkg.version, "checksum mismatch");
            return Err(Error::ChecksumMismatch {
                identity: pkg.identity.clone(),
                version: pkg.version.clone(),
                expected: pkg.checksum.clone(),
                actual,
            });
        }

        let limits = self.options.limits;
        let path = staged.to_path_buf();
        let manifest = tokio::task::spawn_blocking(move || archive::inspect_file(&path, limits))
            .await
            .map_err(|e| Error::context("archive inspection", e))??;
        if manifest.package.name != pkg.identity || manifest.package.version != pkg.version {
            return Err(Error::Archive(format!(
                "archive for {}@{} from '{source}' contains {}@{}",
                pkg.identity, pkg.version, manifest.package.name, manifest.package.version
            )));
        }

        let bytes = tokio::fs::read(&staged).await?;
        let verification = check_declared_signer(
            verify_signature(&bytes, wanted.signature.as_ref(), &self.trust_store),
            manifest.trust.as_ref(),
            wanted.signature.as_ref(),
        );
        let warnings = self.check_policy(&wanted, &verification)?;
        self.reporter
            .verified(&pkg.identity, &pkg.version, verification.identity.as_deref());

        self.cache.store_verified(&wanted, &staged).await?;
        tracing::debug!(identity = %pkg.identity, version = %pkg.version, %source, "admitted to cache");
        self.reporter.done(&pkg.identity, &pkg.version, &source);
        Ok(warnings)
    }

    /// Download into `dest`, trying the recorded source first.
    async fn fetch_into(&self, pkg: &ResolvedPackage, dest: &Path) -> Result<String> {
        let mut last = None;
        for registry in self.in_preference(&pkg.source) {
            if registry.name() == CACHE_REGISTRY {
                continue;
            }
            self.reporter.fetching(&pkg.identity, &pkg.version, registry.name());
            match registry.fetch_archive(&pkg.identity, &pkg.version, dest).await {
                Ok(_) => return Ok(registry.name().to_string()),
                Err(e) if e.is_not_found() => last = Some(e),
                Err(e) => {
                    self.reporter.failed(&pkg.identity, &pkg.version, &e.to_string());
                    return Err(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::not_found(format!("archive {}@{}", pkg.identity, pkg.version))))
    }

    fn check_policy(&self, record: &PackageVersion, verification: &VerificationResult) -> Result<Vec<String>> {
        match self.policy.evaluate(record, SignatureStatus::Verified(verification)) {
            PolicyDecision::Allow { warnings } => Ok(warnings),
            PolicyDecision::Reject(PolicyViolation::Signature { reason })
                if verification.signed && !verification.valid =>
            {
                Err(Error::SignatureInvalid {
                    identity: record.identity.clone(),
                    version: record.version.clone(),
                    reason,
                })
            }
            PolicyDecision::Reject(violation) => Err(Error::PolicyBlocked {
                identity: record.identity.clone(),
                version: record.version.clone(),
                violation,
            }),
        }
    }

    /// Extract every package of `set` from the cache into `dest`.
    ///
    /// Each package lands in `dest/<scope>/<name>`, replacing what was there.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if a package is not cached, or any extraction error.
    pub async fn materialize(&self, set: &ResolvedSet, dest: &Path) -> Result<Vec<ExtractedArtifact>> {
        let staging = staging_path(&self.home);
        tokio::fs::create_dir_all(&staging).await?;
        let mut extracted = Vec::with_capacity(set.len());
        for pkg in set {
            let archive_path = self.cache.archive_path(&pkg.identity, &pkg.version);
            if !tokio::fs::try_exists(&archive_path).await.unwrap_or(false) {
                return Err(Error::not_found(format!(
                    "{}@{} in the install cache",
                    pkg.identity, pkg.version
                )));
            }

            let scratch = tempfile::tempdir_in(&staging)?;
            let unpacked = scratch.path().join("package");
            let limits = self.options.limits;
            let into = unpacked.clone();
            tokio::task::spawn_blocking(move || archive::unpack(&archive_path, &into, limits))
                .await
                .map_err(|e| Error::context("archive extraction", e))??;
            let manifest_text = tokio::fs::read_to_string(unpacked.join(plinth_schema::MANIFEST_FILE)).await?;
            let manifest = plinth_schema::Manifest::from_toml_str(&manifest_text)?;

            let root = dest.join(pkg.identity.storage_dir());
            if tokio::fs::try_exists(&root).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&root).await?;
            }
            if let Some(parent) = root.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&unpacked, &root).await?;

            let artifacts = manifest.package.artifacts.iter().map(|a| root.join(a)).collect();
            self.reporter.done(&pkg.identity, &pkg.version, "materialized");
            extracted.push(ExtractedArtifact {
                identity: pkg.identity.clone(),
                version: pkg.version.clone(),
                root,
                artifacts,
            });
        }
        Ok(extracted)
    }
}

/// The locked set, after checking that it answers this request.
fn frozen_set(lock: &LockFile, identity: &PackageIdentity, spec: &DependencySpec) -> Result<ResolvedSet> {
    let unresolvable = |reason: String| Error::Unresolvable {
        identity: identity.clone(),
        spec: spec.clone(),
        reason,
    };
    let entry = lock
        .find(identity)
        .ok_or_else(|| unresolvable("it is not in the lock file".to_string()))?;
    if let DependencySpec::Version(constraint) = spec {
        if !constraint.matches(&entry.version) {
            return Err(unresolvable(format!(
                "the lock file pins {}, which does not satisfy it",
                entry.version
            )));
        }
    }
    Ok(lock::read(lock))
}
