//! Lock file conversion, persistence, and drift detection.
//!
//! The document format itself lives in `plinth_schema::lock`; this module
//! maps it to and from a [`ResolvedSet`] and moves it on and off disk.

use chrono::Utc;
use plinth_schema::lock::LOCK_FORMAT_VERSION;
use plinth_schema::{LockEntry, LockFile, PackageIdentity, ResolvedPackage, ResolvedSet, Version};
use std::fmt;
use std::path::Path;

use crate::error::Result;
use crate::io::write_atomic;

/// Lock document for `set`, stamped with the current time.
pub fn write(set: &ResolvedSet) -> LockFile {
    LockFile {
        version: LOCK_FORMAT_VERSION,
        resolved_at: Utc::now(),
        root: None,
        package: set
            .iter()
            .map(|p| LockEntry {
                name: p.identity.clone(),
                version: p.version.clone(),
                source: p.source.clone(),
                checksum: p.checksum.clone(),
                size: p.size,
                dependencies: p.dependencies.clone(),
            })
            .collect(),
    }
}

/// The resolved set a lock document pins.
pub fn read(lock: &LockFile) -> ResolvedSet {
    lock.package
        .iter()
        .map(|e| ResolvedPackage {
            identity: e.name.clone(),
            version: e.version.clone(),
            source: e.source.clone(),
            checksum: e.checksum.clone(),
            size: e.size,
            dependencies: e.dependencies.clone(),
        })
        .collect()
}

/// Read a lock file, or `None` if there is none at `path`.
///
/// # Errors
///
/// Fails if the file exists but cannot be read or parsed.
pub async fn load(path: &Path) -> Result<Option<LockFile>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(LockFile::from_toml_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a lock file atomically.
///
/// # Errors
///
/// Fails on serialization or I/O errors.
pub async fn save(lock: &LockFile, path: &Path) -> Result<()> {
    let content = lock.to_toml_string()?;
    write_atomic(path, content.as_bytes()).await?;
    tracing::debug!(path = %path.display(), packages = lock.package.len(), "lock file written");
    Ok(())
}

/// A package pinned differently in the lock than in a fresh resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftChange {
    /// The package that moved.
    pub identity: PackageIdentity,
    /// Version in the lock file.
    pub locked: Version,
    /// Version the fresh resolution chose.
    pub fresh: Version,
    /// Same version, different bytes.
    pub checksum_changed: bool,
}

/// Differences between a lock file and a resolved set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// In the fresh set only.
    pub added: Vec<PackageIdentity>,
    /// In the lock only.
    pub removed: Vec<PackageIdentity>,
    /// In both, pinned differently.
    pub changed: Vec<DriftChange>,
}

impl DriftReport {
    /// Whether the lock and the fresh set agree.
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "no drift");
        }
        let mut parts = Vec::new();
        parts.extend(self.added.iter().map(|id| format!("+{id}")));
        parts.extend(self.removed.iter().map(|id| format!("-{id}")));
        for c in &self.changed {
            if c.checksum_changed {
                parts.push(format!("{}@{} (checksum changed)", c.identity, c.fresh));
            } else {
                parts.push(format!("{} {} -> {}", c.identity, c.locked, c.fresh));
            }
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Compare a lock file with a fresh resolution. All lists are in identity order.
pub fn diff(lock: &LockFile, fresh: &ResolvedSet) -> DriftReport {
    let locked = read(lock);
    let mut report = DriftReport::default();
    for pkg in fresh {
        match locked.get(&pkg.identity) {
            None => report.added.push(pkg.identity.clone()),
            Some(old) if old.version != pkg.version || old.checksum != pkg.checksum => {
                report.changed.push(DriftChange {
                    identity: pkg.identity.clone(),
                    locked: old.version.clone(),
                    fresh: pkg.version.clone(),
                    checksum_changed: old.version == pkg.version,
                });
            }
            Some(_) => {}
        }
    }
    report.removed = locked
        .iter()
        .filter(|p| !fresh.contains(&p.identity))
        .map(|p| p.identity.clone())
        .collect();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_schema::Sha256Digest;
    use std::collections::BTreeMap;

    fn pkg(name: &str, version: &str, deps: &[(&str, &str)]) -> ResolvedPackage {
        ResolvedPackage {
            identity: name.parse().unwrap(),
            version: version.parse().unwrap(),
            source: "local".into(),
            checksum: Sha256Digest::from_bytes([7; 32]),
            size: 10,
            dependencies: deps
                .iter()
                .map(|(d, v)| (d.parse().unwrap(), v.parse().unwrap()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn sample() -> ResolvedSet {
        [
            pkg("@acme/app", "1.0.0", &[("util", "2.1.0")]),
            pkg("util", "2.1.0", &[]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn read_inverts_write() {
        let set = sample();
        assert_eq!(read(&write(&set)), set);
    }

    #[tokio::test]
    async fn saved_lock_loads_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plinth.lock");
        assert!(load(&path).await.unwrap().is_none());

        let lock = write(&sample());
        save(&lock, &path).await.unwrap();
        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, lock);

        // Re-serializing is byte-stable.
        let first = std::fs::read_to_string(&path).unwrap();
        save(&loaded, &path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[tokio::test]
    async fn malformed_lock_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plinth.lock");
        std::fs::write(&path, "version = 99\nresolved_at = 1979-05-27T07:32:00Z\n").unwrap();
        assert!(load(&path).await.is_err());
    }

    #[test]
    fn diff_reports_added_removed_and_changed() {
        let lock = write(&sample());
        assert!(diff(&lock, &sample()).is_clean());

        let mut bumped = pkg("util", "2.2.0", &[]);
        bumped.source = "remote".into();
        let fresh: ResolvedSet = [pkg("@acme/app", "1.0.0", &[("util", "2.2.0")]), bumped, pkg("extra", "0.1.0", &[])]
            .into_iter()
            .collect();
        let report = diff(&lock, &fresh);
        assert_eq!(report.added, vec!["extra".parse().unwrap()]);
        assert!(report.removed.is_empty());
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.changed[0].fresh.to_string(), "2.2.0");
        assert!(!report.changed[0].checksum_changed);

        let shrunk: ResolvedSet = [pkg("util", "2.1.0", &[])].into_iter().collect();
        let report = diff(&lock, &shrunk);
        assert_eq!(report.removed, vec!["@acme/app".parse().unwrap()]);
    }

    #[test]
    fn same_version_with_new_bytes_is_drift() {
        let lock = write(&sample());
        let mut tampered = pkg("util", "2.1.0", &[]);
        tampered.checksum = Sha256Digest::from_bytes([8; 32]);
        let fresh: ResolvedSet = [pkg("@acme/app", "1.0.0", &[("util", "2.1.0")]), tampered]
            .into_iter()
            .collect();
        let report = diff(&lock, &fresh);
        assert!(report.changed[0].checksum_changed);
        assert!(report.to_string().contains("checksum changed"));
    }
}
