//! Reporter trait for dependency injection
//!
//! Core logic reports progress through this trait so that a CLI, an editor
//! integration, or a test harness can each render it their own way.

use plinth_schema::{PackageIdentity, Version};

/// Receives progress events from the resolver and installer.
pub trait Reporter: Send + Sync {
    /// A named phase started (e.g. "Resolving", "Fetching").
    fn section(&self, title: &str);

    /// An archive download started.
    fn fetching(&self, identity: &PackageIdentity, version: &Version, source: &str);

    /// An archive passed checksum and signature checks.
    fn verified(&self, identity: &PackageIdentity, version: &Version, signer: Option<&str>);

    /// A package is now present in the installed cache.
    fn done(&self, identity: &PackageIdentity, version: &Version, detail: &str);

    /// A package operation failed.
    fn failed(&self, identity: &PackageIdentity, version: &Version, reason: &str);

    /// A non-fatal problem the user should see.
    fn warning(&self, msg: &str);

    /// Final summary of an operation.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn fetching(&self, identity: &PackageIdentity, version: &Version, source: &str) {
        (**self).fetching(identity, version, source);
    }
    fn verified(&self, identity: &PackageIdentity, version: &Version, signer: Option<&str>) {
        (**self).verified(identity, version, signer);
    }
    fn done(&self, identity: &PackageIdentity, version: &Version, detail: &str) {
        (**self).done(identity, version, detail);
    }
    fn failed(&self, identity: &PackageIdentity, version: &Version, reason: &str) {
        (**self).failed(identity, version, reason);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// A reporter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _title: &str) {}
    fn fetching(&self, _identity: &PackageIdentity, _version: &Version, _source: &str) {}
    fn verified(&self, _identity: &PackageIdentity, _version: &Version, _signer: Option<&str>) {}
    fn done(&self, _identity: &PackageIdentity, _version: &Version, _detail: &str) {}
    fn failed(&self, _identity: &PackageIdentity, _version: &Version, _reason: &str) {}
    fn warning(&self, _msg: &str) {}
    fn summary(&self, _count: usize, _action: &str, _elapsed_secs: f64) {}
}

/// A reporter that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn section(&self, title: &str) {
        tracing::info!("{title}");
    }
    fn fetching(&self, identity: &PackageIdentity, version: &Version, source: &str) {
        tracing::info!(%identity, %version, source, "fetching");
    }
    fn verified(&self, identity: &PackageIdentity, version: &Version, signer: Option<&str>) {
        tracing::info!(%identity, %version, signer = signer.unwrap_or("-"), "verified");
    }
    fn done(&self, identity: &PackageIdentity, version: &Version, detail: &str) {
        tracing::info!(%identity, %version, detail, "done");
    }
    fn failed(&self, identity: &PackageIdentity, version: &Version, reason: &str) {
        tracing::error!(%identity, %version, reason, "failed");
    }
    fn warning(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        tracing::info!("{action} {count} package(s) in {elapsed_secs:.2}s");
    }
}
