//! On-disk layout under the plinth home directory.

use dirs::home_dir;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable overriding the plinth home directory.
pub const HOME_ENV: &str = "PLINTH_HOME";

/// Returns the plinth home directory, or None if the user's home cannot be resolved.
pub fn try_plinth_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var(HOME_ENV) {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".plinth"))
}

/// Returns the plinth home directory (`~/.plinth`).
///
/// # Errors
///
/// Fails if neither `PLINTH_HOME` is set nor the user's home directory can be
/// resolved.
pub fn plinth_home() -> Result<PathBuf> {
    try_plinth_home().ok_or_else(|| {
        Error::Config("could not determine home directory; set PLINTH_HOME".to_string())
    })
}

/// Installed-artifact cache: <home>/cache
pub fn cache_path(home: &Path) -> PathBuf {
    home.join("cache")
}

/// Git checkouts for git-backed sources: <home>/sources/<name>
pub fn source_checkout_path(home: &Path, source: &str) -> PathBuf {
    home.join("sources").join(source)
}

/// Staging area for downloads: <home>/cache/.staging (same volume as the cache)
pub fn staging_path(home: &Path) -> PathBuf {
    cache_path(home).join(".staging")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_home() {
        let home = Path::new("/tmp/plinth-home");
        assert_eq!(cache_path(home), home.join("cache"));
        assert_eq!(source_checkout_path(home, "team"), home.join("sources/team"));
        assert!(staging_path(home).starts_with(cache_path(home)));
    }
}
