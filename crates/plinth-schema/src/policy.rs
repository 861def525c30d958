//! Trust policy and trust anchors.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::tag::TagName;

/// What to do when a signature is absent or does not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureFailureMode {
    /// Proceed, recording a warning.
    Warn,
    /// Reject the candidate.
    #[default]
    Error,
    /// Proceed silently.
    Allow,
}

/// Per-candidate admission rules.
///
/// Evaluated in field order: scope allow-list, blocked globs, required tag,
/// required signature.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustPolicy {
    /// Scope glob patterns (`@trusted`, `@acme-*`). Unscoped packages are
    /// written `@`. Empty allows every scope.
    pub allowed_scopes: BTreeSet<String>,
    /// Reject candidates without a valid signature (subject to
    /// `on_signature_failure`).
    pub require_signature: bool,
    /// Only admit versions that carry this dist-tag.
    pub require_tag: Option<TagName>,
    /// Glob patterns matched against the rendered identity.
    pub blocked_patterns: BTreeSet<String>,
    /// Signature failure handling.
    pub on_signature_failure: SignatureFailureMode,
}

/// A keyless signer the store trusts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedSigner {
    /// Glob over the certificate subject.
    pub subject: String,
    /// Exact issuer URL.
    pub issuer: String,
}

/// Trust anchors for signature verification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustStore {
    /// Ed25519 public keys (base64) by key id.
    pub keys: BTreeMap<String, String>,
    /// Transparency-log public keys (base64) by log id.
    pub transparency_logs: BTreeMap<String, String>,
    /// Identities accepted for keyless signatures.
    pub signers: Vec<TrustedSigner>,
}
