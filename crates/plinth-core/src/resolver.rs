//! Dependency resolution.
//!
//! Breadth-first over a work queue, one version per identity, no
//! backtracking. Registry lookups for queued items run concurrently in a
//! bounded [`JoinSet`], but their results are applied strictly in queue order,
//! so the first requirement to reach an identity always fixes its version and
//! the same inputs always produce the same set.

use plinth_schema::version::highest_satisfying;
use plinth_schema::{
    DependencySpec, PackageIdentity, PackageVersion, ResolvedPackage, ResolvedSet, TrustPolicy,
    VersionConstraint,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::error::{Conflict, Error, Requirer, Result};
use crate::registry::Registry;
use crate::verify::{CompiledPolicy, PolicyDecision, SignatureStatus};

/// Default number of concurrent registry lookups.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default overall deadline for one resolution.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);

/// Resolver tuning.
#[derive(Debug, Clone, Copy)]
pub struct ResolverOptions {
    /// Maximum registry lookups in flight.
    pub concurrency: usize,
    /// Budget for the whole resolution.
    pub deadline: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

/// Result of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// One version per identity, dependencies linked.
    pub set: ResolvedSet,
    /// Registry records of the chosen versions (signatures, declared specs).
    pub records: BTreeMap<PackageIdentity, PackageVersion>,
    /// Non-fatal policy findings.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
struct Selection {
    source: String,
    record: PackageVersion,
}

#[derive(Debug)]
enum Lookup {
    Found(Selection),
    /// Some sources know the identity but none has a matching version.
    NoMatch(Vec<String>),
    /// No source knows the identity.
    Unknown,
}

type LookupKey = (PackageIdentity, DependencySpec);

struct Pending {
    identity: PackageIdentity,
    spec: DependencySpec,
    requirer: Requirer,
}

/// Resolves a root requirement against sources in precedence order.
#[derive(Clone)]
pub struct Resolver {
    sources: Arc<[Arc<dyn Registry>]>,
    policy: Arc<CompiledPolicy>,
    options: ResolverOptions,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Resolver over `sources` in precedence order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the policy contains an invalid glob.
    pub fn new(sources: Vec<Arc<dyn Registry>>, policy: &TrustPolicy) -> Result<Self> {
        Ok(Self {
            sources: sources.into(),
            policy: Arc::new(CompiledPolicy::new(policy)?),
            options: ResolverOptions::default(),
        })
    }

    /// Replace the default concurrency and deadline.
    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve `root@spec` and everything it transitively needs.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`], [`Error::Unresolvable`], [`Error::PolicyBlocked`],
    /// [`Error::Timeout`], or a registry failure that is not "not found".
    pub async fn resolve(&self, root: &PackageIdentity, spec: &DependencySpec) -> Result<Resolution> {
        let started = std::time::Instant::now();
        let resolution = tokio::time::timeout(self.options.deadline, self.run(root, spec))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("resolving {root} {spec}"),
                after: self.options.deadline,
            })??;
        tracing::info!(
            %root,
            packages = resolution.set.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resolved"
        );
        Ok(resolution)
    }

    async fn run(&self, root: &PackageIdentity, spec: &DependencySpec) -> Result<Resolution> {
        let mut queue = VecDeque::from([Pending {
            identity: root.clone(),
            spec: spec.clone(),
            requirer: Requirer::Root,
        }]);
        let mut set = ResolvedSet::new();
        let mut records = BTreeMap::new();
        let mut origins: HashMap<PackageIdentity, (Requirer, DependencySpec)> = HashMap::new();
        let mut declared: BTreeMap<PackageIdentity, Vec<PackageIdentity>> = BTreeMap::new();
        let mut warnings = Vec::new();

        // `None` marks a lookup that is still in flight.
        let mut lookups: HashMap<LookupKey, Option<Result<Lookup>>> = HashMap::new();
        let mut inflight: JoinSet<(LookupKey, Result<Lookup>)> = JoinSet::new();

        while let Some(head) = queue.front() {
            if let (Some(existing), DependencySpec::Version(constraint)) =
                (set.get(&head.identity), &head.spec)
            {
                if !constraint.matches(&existing.version) {
                    return Err(conflict(&origins, existing, head));
                }
                queue.pop_front();
                continue;
            }

            self.schedule(&queue, &set, &mut lookups, &mut inflight);
            let key = (head.identity.clone(), head.spec.clone());
            if !matches!(lookups.get(&key), Some(Some(_))) {
                match inflight.join_next().await {
                    Some(Ok((done, outcome))) => {
                        lookups.insert(done, Some(outcome));
                    }
                    Some(Err(e)) => return Err(Error::context("registry lookup", e)),
                    None => return Err(Error::context("resolver", "lookup was never scheduled")),
                }
                continue;
            }

            let Some(item) = queue.pop_front() else {
                break;
            };
            let selection = match lookups.remove(&key).flatten() {
                Some(Ok(Lookup::Found(selection))) => {
                    lookups.insert(key, Some(Ok(Lookup::Found(selection.clone()))));
                    selection
                }
                Some(Ok(Lookup::NoMatch(sources))) => {
                    return Err(Error::Unresolvable {
                        identity: item.identity,
                        spec: item.spec,
                        reason: format!("no eligible version in {}", sources.join(", ")),
                    });
                }
                Some(Ok(Lookup::Unknown)) => {
                    return Err(Error::Unresolvable {
                        identity: item.identity,
                        spec: item.spec,
                        reason: "not found in any source".to_string(),
                    });
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::context("resolver", "lookup result missing")),
            };

            // Tag requirement on an identity that is already fixed.
            if let Some(existing) = set.get(&item.identity) {
                if existing.version != selection.record.version {
                    return Err(conflict(&origins, existing, &item));
                }
                continue;
            }

            match self.policy.evaluate(&selection.record, SignatureStatus::Declared) {
                PolicyDecision::Reject(violation) => {
                    return Err(Error::PolicyBlocked {
                        identity: item.identity,
                        version: selection.record.version,
                        violation,
                    });
                }
                PolicyDecision::Allow { warnings: found } => warnings.extend(found),
            }

            let Selection { source, record } = selection;
            tracing::debug!(identity = %record.identity, version = %record.version, %source, "selected");
            let requirer = Requirer::Package(record.identity.clone(), record.version.clone());
            for (dependency, dep_spec) in &record.dependencies {
                queue.push_back(Pending {
                    identity: dependency.clone(),
                    spec: dep_spec.clone(),
                    requirer: requirer.clone(),
                });
            }
            declared.insert(
                record.identity.clone(),
                record.dependencies.keys().cloned().collect(),
            );
            set.insert(ResolvedPackage {
                identity: record.identity.clone(),
                version: record.version.clone(),
                source,
                checksum: record.checksum.clone(),
                size: record.size,
                dependencies: BTreeMap::new(),
            });
            origins.insert(item.identity.clone(), (item.requirer, item.spec));
            records.insert(item.identity, record);
        }

        set.link_dependencies(&declared);
        Ok(Resolution {
            set,
            records,
            warnings,
        })
    }

    /// Start lookups for queued items, front first, up to the concurrency cap.
    fn schedule(
        &self,
        queue: &VecDeque<Pending>,
        set: &ResolvedSet,
        lookups: &mut HashMap<LookupKey, Option<Result<Lookup>>>,
        inflight: &mut JoinSet<(LookupKey, Result<Lookup>)>,
    ) {
        let cap = self.options.concurrency.max(1);
        for item in queue {
            if inflight.len() >= cap {
                break;
            }
            let needed = !set.contains(&item.identity) || matches!(item.spec, DependencySpec::Tag(_));
            let key = (item.identity.clone(), item.spec.clone());
            if !needed || lookups.contains_key(&key) {
                continue;
            }
            lookups.insert(key.clone(), None);
            let sources = Arc::clone(&self.sources);
            inflight.spawn(async move {
                let outcome = select(&sources, &key.0, &key.1).await;
                (key, outcome)
            });
        }
    }
}

fn conflict(
    origins: &HashMap<PackageIdentity, (Requirer, DependencySpec)>,
    existing: &ResolvedPackage,
    second: &Pending,
) -> Error {
    let (first_requirer, first_spec) = origins
        .get(&existing.identity)
        .cloned()
        .unwrap_or_else(|| (Requirer::Root, second.spec.clone()));
    let conflict = Conflict {
        identity: existing.identity.clone(),
        resolved: existing.version.clone(),
        first_requirer,
        first_spec,
        second_requirer: second.requirer.clone(),
        second_spec: second.spec.clone(),
    };
    tracing::debug!("{conflict}");
    Error::Conflict(Box::new(conflict))
}

/// Ask each source in turn; the first one with an eligible version wins.
async fn select(
    sources: &[Arc<dyn Registry>],
    identity: &PackageIdentity,
    spec: &DependencySpec,
) -> Result<Lookup> {
    let mut known_by = Vec::new();
    for registry in sources {
        let versions = match registry.list_versions(identity, true).await {
            Ok(versions) => versions,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        known_by.push(registry.name().to_string());
        let picked = match spec {
            DependencySpec::Version(constraint) => pick(versions, constraint),
            DependencySpec::Tag(tag) => match registry.resolve_tag(identity, tag).await {
                Ok(target) => versions
                    .into_iter()
                    .find(|r| r.version == target && !r.yanked),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
        };
        if let Some(record) = picked {
            return Ok(Lookup::Found(Selection {
                source: registry.name().to_string(),
                record,
            }));
        }
    }
    Ok(if known_by.is_empty() {
        Lookup::Unknown
    } else {
        Lookup::NoMatch(known_by)
    })
}

/// Highest satisfying version; yanked ones only through an exact pin.
fn pick(versions: Vec<PackageVersion>, constraint: &VersionConstraint) -> Option<PackageVersion> {
    let pinned = constraint.exact().is_some();
    let eligible: Vec<PackageVersion> = versions
        .into_iter()
        .filter(|r| !r.yanked || (pinned && constraint.matches(&r.version)))
        .collect();
    let best = highest_satisfying(eligible.iter().map(|r| &r.version), constraint)?.clone();
    eligible.into_iter().find(|r| r.version == best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ArchiveHandle;
    use async_trait::async_trait;
    use plinth_schema::{PackageMetadata, PackageSummary, Sha256Digest, TagName, Version};
    use std::collections::BTreeSet;
    use std::path::Path;

    /// In-memory registry for resolver tests.
    #[derive(Debug, Default)]
    struct MemoryRegistry {
        name: String,
        packages: BTreeMap<PackageIdentity, PackageMetadata>,
        delay: Option<Duration>,
    }

    impl MemoryRegistry {
        fn named(name: &str) -> Self {
            Self {
                name: name.into(),
                ..Self::default()
            }
        }

        fn add(mut self, name: &str, version: &str, deps: &[(&str, &str)]) -> Self {
            self.add_record(name, version, deps, false);
            self
        }

        fn add_yanked(mut self, name: &str, version: &str) -> Self {
            self.add_record(name, version, &[], true);
            self
        }

        fn tag(mut self, name: &str, tag: &str, version: &str) -> Self {
            let id: PackageIdentity = name.parse().unwrap();
            let meta = self.packages.get_mut(&id).unwrap();
            meta.dist_tags.insert(tag.parse().unwrap(), version.parse().unwrap());
            meta.sync_tag_memberships();
            self
        }

        fn add_record(&mut self, name: &str, version: &str, deps: &[(&str, &str)], yanked: bool) {
            let id: PackageIdentity = name.parse().unwrap();
            let meta = self
                .packages
                .entry(id.clone())
                .or_insert_with(|| PackageMetadata::new(id.clone(), ""));
            meta.versions.push(PackageVersion {
                identity: id,
                version: version.parse().unwrap(),
                checksum: Sha256Digest::from_bytes([1; 32]),
                size: 1,
                dependencies: deps
                    .iter()
                    .map(|(d, s)| (d.parse().unwrap(), s.parse().unwrap()))
                    .collect(),
                yanked,
                tags: BTreeSet::new(),
                signature: None,
                published_at: None,
            });
        }
    }

    #[async_trait]
    impl Registry for MemoryRegistry {
        fn name(&self) -> &str {
            &self.name
        }

        async fn search(&self, _query: &str) -> Result<Vec<PackageSummary>> {
            Ok(self.packages.values().map(PackageMetadata::summary).collect())
        }

        async fn get_metadata(&self, identity: &PackageIdentity) -> Result<PackageMetadata> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.packages
                .get(identity)
                .cloned()
                .ok_or_else(|| Error::not_found(identity))
        }

        async fn fetch_archive(
            &self,
            identity: &PackageIdentity,
            _version: &Version,
            _dest: &Path,
        ) -> Result<ArchiveHandle> {
            Err(Error::not_found(identity))
        }
    }

    fn resolver(sources: Vec<MemoryRegistry>) -> Resolver {
        let sources: Vec<Arc<dyn Registry>> = sources
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn Registry>)
            .collect();
        Resolver::new(sources, &TrustPolicy::default()).unwrap()
    }

    fn id(name: &str) -> PackageIdentity {
        name.parse().unwrap()
    }

    fn spec(s: &str) -> DependencySpec {
        s.parse().unwrap()
    }

    fn version_of(resolution: &Resolution, name: &str) -> String {
        resolution.set.get(&id(name)).unwrap().version.to_string()
    }

    #[tokio::test]
    async fn picks_highest_satisfying_and_links_dependencies() {
        let reg = MemoryRegistry::named("mem")
            .add("a", "1.0.0", &[("b", "^1.0.0")])
            .add("b", "1.0.0", &[])
            .add("b", "1.4.2", &[])
            .add("b", "2.0.0", &[]);
        let resolution = resolver(vec![reg]).resolve(&id("a"), &spec("^1.0.0")).await.unwrap();
        assert_eq!(version_of(&resolution, "b"), "1.4.2");
        let a = resolution.set.get(&id("a")).unwrap();
        assert_eq!(a.dependencies[&id("b")].to_string(), "1.4.2");
        assert_eq!(a.source, "mem");
    }

    #[tokio::test]
    async fn skips_yanked_unless_pinned_exactly() {
        let reg = || {
            MemoryRegistry::named("mem")
                .add("b", "1.0.0", &[])
                .add_yanked("b", "2.0.0")
        };
        let r = resolver(vec![reg()]).resolve(&id("b"), &spec("^2.0.0")).await;
        assert!(matches!(r, Err(Error::Unresolvable { .. })));

        let r = resolver(vec![reg()]).resolve(&id("b"), &spec(">=1.0.0")).await.unwrap();
        assert_eq!(version_of(&r, "b"), "1.0.0");

        let r = resolver(vec![reg()]).resolve(&id("b"), &spec("2.0.0")).await.unwrap();
        assert_eq!(version_of(&r, "b"), "2.0.0");
    }

    #[tokio::test]
    async fn first_requirement_fixes_the_version() {
        // a needs c >=2.0.0 (gets 2.1.0); d, reached later, needs c <2.0.0.
        let reg = MemoryRegistry::named("mem")
            .add("root", "1.0.0", &[("a", "*"), ("d", "*")])
            .add("a", "1.0.0", &[("c", ">=2.0.0")])
            .add("d", "1.0.0", &[("c", "<2.0.0")])
            .add("c", "1.5.0", &[])
            .add("c", "2.1.0", &[]);
        let err = resolver(vec![reg]).resolve(&id("root"), &spec("*")).await.unwrap_err();
        let Error::Conflict(conflict) = err else {
            panic!("expected a conflict, got {err}");
        };
        assert_eq!(conflict.identity, id("c"));
        assert_eq!(conflict.resolved.to_string(), "2.1.0");
        assert_eq!(conflict.first_requirer, Requirer::Package(id("a"), "1.0.0".parse().unwrap()));
        assert_eq!(conflict.second_requirer, Requirer::Package(id("d"), "1.0.0".parse().unwrap()));
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let reg = MemoryRegistry::named("mem")
            .add("a", "1.0.0", &[("b", "^1")])
            .add("b", "1.0.0", &[("a", "^1")]);
        let r = resolver(vec![reg]).resolve(&id("a"), &spec("^1")).await.unwrap();
        assert_eq!(r.set.len(), 2);
        assert_eq!(r.set.get(&id("b")).unwrap().dependencies[&id("a")].to_string(), "1.0.0");
    }

    #[tokio::test]
    async fn first_source_with_a_match_wins() {
        let cache = MemoryRegistry::named("cache").add("a", "1.0.0", &[]);
        let remote = MemoryRegistry::named("remote")
            .add("a", "1.0.0", &[])
            .add("a", "1.9.0", &[])
            .add("a", "2.0.0", &[]);
        let resolver = resolver(vec![cache, remote]);

        let r = resolver.resolve(&id("a"), &spec("^1.0.0")).await.unwrap();
        assert_eq!(r.set.get(&id("a")).unwrap().source, "cache");
        assert_eq!(version_of(&r, "a"), "1.0.0");

        let r = resolver.resolve(&id("a"), &spec("^2.0.0")).await.unwrap();
        assert_eq!(r.set.get(&id("a")).unwrap().source, "remote");
    }

    #[tokio::test]
    async fn unknown_identity_is_unresolvable() {
        let reg = MemoryRegistry::named("mem").add("a", "1.0.0", &[("ghost", "^1")]);
        let err = resolver(vec![reg]).resolve(&id("a"), &spec("^1")).await.unwrap_err();
        match err {
            Error::Unresolvable { identity, reason, .. } => {
                assert_eq!(identity, id("ghost"));
                assert!(reason.contains("not found in any source"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn tags_resolve_and_conflict_with_fixed_versions() {
        let reg = || {
            MemoryRegistry::named("mem")
                .add("a", "1.0.0", &[("c", "1.0.0"), ("b", "*")])
                .add("b", "1.0.0", &[("c", "beta")])
                .add("c", "1.0.0", &[])
                .add("c", "2.0.0-rc.1", &[])
                .tag("c", "beta", "2.0.0-rc.1")
        };
        let err = resolver(vec![reg()]).resolve(&id("a"), &spec("^1")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let r = resolver(vec![reg()]).resolve(&id("c"), &spec("beta")).await.unwrap();
        assert_eq!(version_of(&r, "c"), "2.0.0-rc.1");
        let missing = resolver(vec![reg()]).resolve(&id("c"), &spec("nightly")).await;
        assert!(matches!(missing, Err(Error::Unresolvable { .. })));
    }

    #[tokio::test]
    async fn policy_blocks_candidates() {
        let reg = MemoryRegistry::named("mem")
            .add("@trusted/a", "1.0.0", &[("@other/b", "^1")])
            .add("@other/b", "1.0.0", &[]);
        let mut policy = TrustPolicy::default();
        policy.allowed_scopes.insert("@trusted".into());
        let sources: Vec<Arc<dyn Registry>> = vec![Arc::new(reg)];
        let err = Resolver::new(sources, &policy)
            .unwrap()
            .resolve(&id("@trusted/a"), &spec("^1"))
            .await
            .unwrap_err();
        match err {
            Error::PolicyBlocked { identity, .. } => assert_eq!(identity, id("@other/b")),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn required_tag_is_checked_during_resolution() {
        let reg = MemoryRegistry::named("mem")
            .add("a", "1.0.0", &[])
            .add("a", "1.1.0", &[])
            .tag("a", "stable", "1.0.0");
        let mut policy = TrustPolicy::default();
        policy.require_tag = Some(TagName::new("stable").unwrap());
        let sources: Vec<Arc<dyn Registry>> = vec![Arc::new(reg)];
        let err = Resolver::new(sources, &policy)
            .unwrap()
            .resolve(&id("a"), &spec("^1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyBlocked { .. }));
    }

    #[tokio::test]
    async fn deadline_bounds_the_whole_resolution() {
        let mut reg = MemoryRegistry::named("slow").add("a", "1.0.0", &[]);
        reg.delay = Some(Duration::from_secs(5));
        let options = ResolverOptions {
            concurrency: 2,
            deadline: Duration::from_millis(50),
        };
        let err = resolver(vec![reg])
            .with_options(options)
            .resolve(&id("a"), &spec("^1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn results_do_not_depend_on_concurrency() {
        let reg = || {
            let mut reg = MemoryRegistry::named("mem").add(
                "root",
                "1.0.0",
                &[("a", "*"), ("b", "*"), ("c", "*"), ("d", "*")],
            );
            for name in ["a", "b", "c", "d"] {
                reg = reg.add(name, "1.0.0", &[("shared", "^1")]).add(name, "1.1.0", &[("shared", "~1.2")]);
            }
            reg.add("shared", "1.2.0", &[]).add("shared", "1.3.0", &[])
        };
        let mut outcomes = Vec::new();
        for concurrency in [1, 2, 8] {
            let options = ResolverOptions {
                concurrency,
                deadline: DEFAULT_DEADLINE,
            };
            let r = resolver(vec![reg()])
                .with_options(options)
                .resolve(&id("root"), &spec("*"))
                .await
                .unwrap();
            outcomes.push(r.set);
        }
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(
            outcomes[0].get(&id("shared")).unwrap().version.to_string(),
            "1.2.0"
        );
    }
}
