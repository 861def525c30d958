//! Parse errors shared by every schema type.

/// A value did not match the grammar of the type it was parsed into.
///
/// Parse errors are never retried and never downgraded: a malformed
/// constraint does not silently match "any version".
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed package identity.
    #[error("invalid package identity '{input}': {reason}")]
    Identity {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Malformed semantic version.
    #[error("invalid version '{input}': {reason}")]
    Version {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Malformed version constraint.
    #[error("invalid version constraint '{input}': {reason}")]
    Constraint {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Malformed dist-tag name.
    #[error("invalid tag name '{input}': {reason}")]
    Tag {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Malformed content digest.
    #[error("invalid digest '{input}': {reason}")]
    Digest {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Malformed manifest or lock file document.
    #[error("invalid {document}: {reason}")]
    Document {
        /// Which document failed (e.g. `plinth.toml`).
        document: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl ParseError {
    pub(crate) fn identity(input: &str, reason: impl Into<String>) -> Self {
        Self::Identity {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn version(input: &str, reason: impl Into<String>) -> Self {
        Self::Version {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn constraint(input: &str, reason: impl Into<String>) -> Self {
        Self::Constraint {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn tag(input: &str, reason: impl Into<String>) -> Self {
        Self::Tag {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
