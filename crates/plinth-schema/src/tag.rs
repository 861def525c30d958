//! Dist-tags and dependency requests.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ParseError;
use crate::identity::PackageIdentity;
use crate::version::{Version, VersionConstraint};

/// Tag advanced on every publish unless the publisher names another tag.
pub const LATEST: &str = "latest";

/// Maximum length of a tag name.
pub const MAX_TAG_LEN: usize = 64;

/// A validated dist-tag name.
///
/// Tag names start with a lowercase letter, so they can never be mistaken
/// for a version string or a constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagName(String);

impl TagName {
    /// Validate and wrap a tag name.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Tag`] if `name` is empty, too long, parses as a
    /// version, or contains characters outside `[a-z0-9._-]`.
    pub fn new(name: &str) -> Result<Self, ParseError> {
        if name.is_empty() {
            return Err(ParseError::tag(name, "tag name is empty"));
        }
        if name.len() > MAX_TAG_LEN {
            return Err(ParseError::tag(
                name,
                format!("tag name exceeds {MAX_TAG_LEN} characters"),
            ));
        }
        if Version::parse(name).is_ok() {
            return Err(ParseError::tag(name, "tag name must not be a version"));
        }
        if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
            return Err(ParseError::tag(name, "tag name must start with a lowercase letter"));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')))
        {
            return Err(ParseError::tag(name, format!("invalid character '{bad}'")));
        }
        Ok(Self(name.to_string()))
    }

    /// The `latest` tag.
    pub fn latest() -> Self {
        Self(LATEST.to_string())
    }

    /// Return the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TagName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TagName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TagName {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<TagName> for String {
    fn from(tag: TagName) -> Self {
        tag.0
    }
}

/// A mutable alias from `(identity, tag)` to a concrete version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistTag {
    /// Package the tag belongs to.
    pub identity: PackageIdentity,
    /// Tag name.
    pub tag: TagName,
    /// Version the tag currently points at.
    pub version: Version,
}

/// What a dependency edge asks for: a version constraint or a dist-tag.
///
/// ```
/// use plinth_schema::DependencySpec;
///
/// assert!(matches!("^1.0.0".parse(), Ok(DependencySpec::Version(_))));
/// assert!(matches!("beta".parse(), Ok(DependencySpec::Tag(_))));
/// assert!("not a constraint".parse::<DependencySpec>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DependencySpec {
    /// A version constraint.
    Version(VersionConstraint),
    /// A dist-tag reference, resolved to a version before selection.
    Tag(TagName),
}

impl DependencySpec {
    /// The constraint, if this is not a tag reference.
    pub fn constraint(&self) -> Option<&VersionConstraint> {
        match self {
            Self::Version(c) => Some(c),
            Self::Tag(_) => None,
        }
    }
}

impl FromStr for DependencySpec {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.starts_with(|c: char| c.is_ascii_lowercase()) {
            return TagName::new(text).map(Self::Tag);
        }
        text.parse().map(Self::Version)
    }
}

impl std::fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version(c) => write!(f, "{c}"),
            Self::Tag(t) => write!(f, "{t}"),
        }
    }
}

impl From<VersionConstraint> for DependencySpec {
    fn from(c: VersionConstraint) -> Self {
        Self::Version(c)
    }
}

impl TryFrom<String> for DependencySpec {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DependencySpec> for String {
    fn from(spec: DependencySpec) -> Self {
        spec.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_are_never_versions() {
        assert!(TagName::new("latest").is_ok());
        assert!(TagName::new("next-2.x").is_ok());
        assert!(TagName::new("1.0.0").is_err());
        assert!(TagName::new("").is_err());
        assert!(TagName::new("Beta").is_err());
        assert!(TagName::new("has space").is_err());
    }

    #[test]
    fn dependency_spec_distinguishes_tags() {
        assert_eq!(
            "latest".parse::<DependencySpec>().unwrap(),
            DependencySpec::Tag(TagName::latest())
        );
        let spec: DependencySpec = ">=2.0.0".parse().unwrap();
        assert_eq!(spec.to_string(), ">=2.0.0");
        assert!(spec.constraint().is_some());
        assert!("^x".parse::<DependencySpec>().is_err());
    }
}
