//! Trust policy evaluation.

use glob::Pattern;
use plinth_schema::{PackageVersion, SignatureFailureMode, SignatureMethod, TagName, TrustPolicy};
use std::fmt;

use super::VerificationResult;
use crate::error::{Error, Result};

/// Why a candidate was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    /// Scope is not on the allow-list.
    ScopeNotAllowed {
        /// The candidate's scope label.
        scope: String,
    },
    /// Identity matches a blocked pattern.
    Blocked {
        /// The pattern that matched.
        pattern: String,
    },
    /// Version lacks the required dist-tag.
    MissingTag {
        /// The tag the policy requires.
        tag: TagName,
    },
    /// Signature absent or untrusted and the policy says to fail.
    Signature {
        /// Why the signature did not count.
        reason: String,
    },
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScopeNotAllowed { scope } => write!(f, "scope {scope} is not allowed"),
            Self::Blocked { pattern } => write!(f, "matches blocked pattern '{pattern}'"),
            Self::MissingTag { tag } => write!(f, "version is not tagged '{tag}'"),
            Self::Signature { reason } => write!(f, "signature check failed: {reason}"),
        }
    }
}

/// What is known about the candidate's signature when the policy runs.
#[derive(Debug, Clone, Copy)]
pub enum SignatureStatus<'a> {
    /// Only the registry's record is available (during resolution).
    Declared,
    /// The archive was fetched and the signature checked.
    Verified(&'a VerificationResult),
}

/// Outcome of evaluating a [`CompiledPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Admit the candidate.
    Allow {
        /// Findings the `warn` failure mode let through.
        warnings: Vec<String>,
    },
    /// Turn it away.
    Reject(PolicyViolation),
}

impl PolicyDecision {
    /// Whether the candidate may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// A [`TrustPolicy`] with its glob patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    allowed_scopes: Vec<Pattern>,
    blocked: Vec<(String, Pattern)>,
    require_tag: Option<TagName>,
    require_signature: bool,
    on_failure: SignatureFailureMode,
}

impl CompiledPolicy {
    /// Compile the policy's patterns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a pattern is not a valid glob.
    pub fn new(policy: &TrustPolicy) -> Result<Self> {
        let compile = |p: &String| {
            Pattern::new(p).map_err(|e| Error::Config(format!("bad trust pattern '{p}': {e}")))
        };
        Ok(Self {
            allowed_scopes: policy
                .allowed_scopes
                .iter()
                .map(compile)
                .collect::<Result<_>>()?,
            blocked: policy
                .blocked_patterns
                .iter()
                .map(|p| compile(p).map(|pat| (p.clone(), pat)))
                .collect::<Result<_>>()?,
            require_tag: policy.require_tag.clone(),
            require_signature: policy.require_signature,
            on_failure: policy.on_signature_failure,
        })
    }

    /// Run the rules in order: scope, blocked patterns, tag, signature.
    pub fn evaluate(&self, candidate: &PackageVersion, signature: SignatureStatus<'_>) -> PolicyDecision {
        let scope = candidate.identity.scope_label();
        if !self.allowed_scopes.is_empty() && !self.allowed_scopes.iter().any(|p| p.matches(&scope)) {
            return PolicyDecision::Reject(PolicyViolation::ScopeNotAllowed { scope });
        }

        let rendered = candidate.identity.to_string();
        if let Some((raw, _)) = self.blocked.iter().find(|(_, p)| p.matches(&rendered)) {
            return PolicyDecision::Reject(PolicyViolation::Blocked {
                pattern: raw.clone(),
            });
        }

        if let Some(tag) = self.require_tag.as_ref().filter(|t| !candidate.has_tag(t)) {
            return PolicyDecision::Reject(PolicyViolation::MissingTag { tag: tag.clone() });
        }

        let mut warnings = Vec::new();
        if let Some(reason) = self.signature_failure(candidate, signature) {
            match self.on_failure {
                SignatureFailureMode::Error => {
                    return PolicyDecision::Reject(PolicyViolation::Signature { reason });
                }
                SignatureFailureMode::Warn => warnings.push(format!(
                    "{}@{}: {reason}",
                    candidate.identity, candidate.version
                )),
                SignatureFailureMode::Allow => {}
            }
        }
        PolicyDecision::Allow { warnings }
    }

    fn signature_failure(&self, candidate: &PackageVersion, status: SignatureStatus<'_>) -> Option<String> {
        match status {
            SignatureStatus::Declared => {
                let declared = candidate
                    .signature
                    .as_ref()
                    .is_some_and(|s| s.method != SignatureMethod::Unknown);
                (self.require_signature && !declared).then(|| "package is unsigned".to_string())
            }
            SignatureStatus::Verified(result) if !result.signed => {
                self.require_signature.then(|| result.detail.clone())
            }
            SignatureStatus::Verified(result) if !result.valid => Some(result.detail.clone()),
            SignatureStatus::Verified(_) => None,
        }
    }
}

/// Compile `policy` and evaluate it against one candidate.
///
/// # Errors
///
/// Returns [`Error::Config`] if a pattern in the policy is not a valid glob.
pub fn evaluate_policy(
    candidate: &PackageVersion,
    policy: &TrustPolicy,
    signature: SignatureStatus<'_>,
) -> Result<PolicyDecision> {
    Ok(CompiledPolicy::new(policy)?.evaluate(candidate, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{sign_with_key, verify_signature};
    use plinth_schema::{Sha256Digest, TrustStore};
    use std::collections::{BTreeMap, BTreeSet};

    fn candidate(name: &str) -> PackageVersion {
        PackageVersion {
            identity: name.parse().unwrap(),
            version: "1.0.0".parse().unwrap(),
            checksum: Sha256Digest::from_bytes([0; 32]),
            size: 1,
            dependencies: BTreeMap::new(),
            yanked: false,
            tags: BTreeSet::new(),
            signature: None,
            published_at: None,
        }
    }

    fn policy() -> TrustPolicy {
        TrustPolicy::default()
    }

    #[test]
    fn empty_policy_allows_everything() {
        let decision = evaluate_policy(&candidate("anything"), &policy(), SignatureStatus::Declared).unwrap();
        assert_eq!(decision, PolicyDecision::Allow { warnings: vec![] });
    }

    #[test]
    fn scope_allow_list_uses_globs() {
        let mut p = policy();
        p.allowed_scopes.insert("@trusted".into());
        p.allowed_scopes.insert("@acme-*".into());
        let check = |name: &str| evaluate_policy(&candidate(name), &p, SignatureStatus::Declared).unwrap();

        assert!(check("@trusted/a").is_allowed());
        assert!(check("@acme-labs/b").is_allowed());
        assert!(matches!(
            check("@other/c"),
            PolicyDecision::Reject(PolicyViolation::ScopeNotAllowed { .. })
        ));
        assert!(!check("plain").is_allowed());
    }

    #[test]
    fn blocked_patterns_match_full_identity() {
        let mut p = policy();
        p.blocked_patterns.insert("@acme/legacy-*".into());
        let blocked = evaluate_policy(&candidate("@acme/legacy-rules"), &p, SignatureStatus::Declared).unwrap();
        assert!(matches!(blocked, PolicyDecision::Reject(PolicyViolation::Blocked { .. })));
        assert!(evaluate_policy(&candidate("@acme/rules"), &p, SignatureStatus::Declared).unwrap().is_allowed());
    }

    #[test]
    fn required_tag_checks_membership() {
        let mut p = policy();
        p.require_tag = Some("stable".parse().unwrap());
        let mut c = candidate("a");
        assert!(!evaluate_policy(&c, &p, SignatureStatus::Declared).unwrap().is_allowed());
        c.tags.insert("stable".parse().unwrap());
        assert!(evaluate_policy(&c, &p, SignatureStatus::Declared).unwrap().is_allowed());
    }

    #[test]
    fn signature_failure_modes() {
        let mut p = policy();
        p.require_signature = true;
        let c = candidate("a");

        assert!(matches!(
            evaluate_policy(&c, &p, SignatureStatus::Declared).unwrap(),
            PolicyDecision::Reject(PolicyViolation::Signature { .. })
        ));

        p.on_signature_failure = SignatureFailureMode::Warn;
        match evaluate_policy(&c, &p, SignatureStatus::Declared).unwrap() {
            PolicyDecision::Allow { warnings } => assert_eq!(warnings.len(), 1),
            other => panic!("expected warning, got {other:?}"),
        }

        p.on_signature_failure = SignatureFailureMode::Allow;
        assert_eq!(
            evaluate_policy(&c, &p, SignatureStatus::Declared).unwrap(),
            PolicyDecision::Allow { warnings: vec![] }
        );
    }

    #[test]
    fn invalid_signature_fails_even_when_not_required() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[4; 32]);
        let record = sign_with_key(b"archive", "unknown-key", &key);
        let result = verify_signature(b"archive", Some(&record), &TrustStore::default());
        let decision = evaluate_policy(&candidate("a"), &policy(), SignatureStatus::Verified(&result)).unwrap();
        assert!(matches!(decision, PolicyDecision::Reject(PolicyViolation::Signature { .. })));
    }
}
