//! Package identities: `name` or `@scope/name`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ParseError;

/// Maximum length of a single identity segment (scope or name).
pub const MAX_SEGMENT_LEN: usize = 64;

/// Directory used for unscoped packages in on-disk layouts.
pub const UNSCOPED_DIR: &str = "_";

/// A package identity: an optional scope plus a name.
///
/// Rendered as `@scope/name` or `name`. The unscoped namespace and every
/// named scope are independent, so `tool` and `@acme/tool` are different
/// packages. Ordering puts unscoped identities first, which keeps every map
/// keyed by identity stable when serialized.
///
/// ```
/// use plinth_schema::PackageIdentity;
///
/// let id: PackageIdentity = "@acme/widgets".parse().unwrap();
/// assert_eq!(id.scope(), Some("acme"));
/// assert_eq!(id.name(), "widgets");
/// assert!("Widgets".parse::<PackageIdentity>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageIdentity {
    scope: Option<String>,
    name: String,
}

impl PackageIdentity {
    /// Build an identity from its parts, validating both segments.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Identity`] if either segment violates the grammar.
    pub fn new(scope: Option<&str>, name: &str) -> Result<Self, ParseError> {
        let rendered = match scope {
            Some(s) => format!("@{s}/{name}"),
            None => name.to_string(),
        };
        if let Some(s) = scope {
            validate_segment(&rendered, "scope", s)?;
        }
        validate_segment(&rendered, "name", name)?;
        Ok(Self {
            scope: scope.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Parse `@scope/name` or `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Identity`] on malformed input.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        if let Some(rest) = input.strip_prefix('@') {
            let Some((scope, name)) = rest.split_once('/') else {
                return Err(ParseError::identity(input, "scoped identity must be '@scope/name'"));
            };
            Self::new(Some(scope), name)
        } else {
            Self::new(None, input)
        }
    }

    /// The scope segment, without the leading `@`.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// The name segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scope as written in policies: `@scope`, or `@` for unscoped packages.
    pub fn scope_label(&self) -> String {
        match &self.scope {
            Some(s) => format!("@{s}"),
            None => "@".to_string(),
        }
    }

    /// Relative directory for this identity in on-disk layouts (`scope/name` or `_/name`).
    pub fn storage_dir(&self) -> PathBuf {
        let scope = self.scope.as_deref().unwrap_or(UNSCOPED_DIR);
        PathBuf::from(scope).join(&self.name)
    }
}

fn validate_segment(input: &str, what: &str, segment: &str) -> Result<(), ParseError> {
    if segment.is_empty() {
        return Err(ParseError::identity(input, format!("{what} is empty")));
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(ParseError::identity(
            input,
            format!("{what} exceeds {MAX_SEGMENT_LEN} characters"),
        ));
    }
    let mut chars = segment.chars();
    if !chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(ParseError::identity(
            input,
            format!("{what} must start with a lowercase letter or digit"),
        ));
    }
    if let Some(bad) =
        chars.find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
    {
        return Err(ParseError::identity(
            input,
            format!("{what} contains invalid character '{bad}'"),
        ));
    }
    Ok(())
}

impl std::fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(s) => write!(f, "@{s}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for PackageIdentity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageIdentity {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PackageIdentity> for String {
    fn from(id: PackageIdentity) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scoped_and_unscoped() {
        let plain = PackageIdentity::parse("jq").unwrap();
        assert_eq!(plain.scope(), None);
        assert_eq!(plain.to_string(), "jq");
        assert_eq!(plain.scope_label(), "@");

        let scoped = PackageIdentity::parse("@trusted/lint-rules").unwrap();
        assert_eq!(scoped.scope(), Some("trusted"));
        assert_eq!(scoped.name(), "lint-rules");
        assert_eq!(scoped.to_string(), "@trusted/lint-rules");
        assert_eq!(scoped.storage_dir(), PathBuf::from("trusted/lint-rules"));
    }

    #[test]
    fn rejects_bad_grammar() {
        for bad in ["", "Upper", "-dash", "a b", "@/x", "@scope", "@scope/", "a/b", "x.y"] {
            assert!(PackageIdentity::parse(bad).is_err(), "{bad} should fail");
        }
        let long = "a".repeat(MAX_SEGMENT_LEN + 1);
        assert!(PackageIdentity::parse(&long).is_err());
        assert!(PackageIdentity::parse(&"a".repeat(MAX_SEGMENT_LEN)).is_ok());
    }

    #[test]
    fn scopes_are_independent_namespaces() {
        let a = PackageIdentity::parse("tool").unwrap();
        let b = PackageIdentity::parse("@acme/tool").unwrap();
        assert_ne!(a, b);
        assert!(a < b, "unscoped identities sort first");
    }

    #[test]
    fn serde_uses_rendered_form() {
        let id = PackageIdentity::parse("@acme/tool").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"@acme/tool\"");
        let back: PackageIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<PackageIdentity>("\"@Bad/x\"").is_err());
    }
}
