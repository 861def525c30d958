//! Publisher signature verification.
//!
//! Two trust models are supported. Key-based signatures name a key the
//! consumer registered in its [`TrustStore`]. Keyless signatures carry an
//! ephemeral public key, the signer identity, and a transparency-log entry;
//! they are trusted when the log's signed entry timestamp checks out against a
//! registered log key and the signer matches a trusted signer pattern.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use plinth_schema::{
    ManifestTrust, SignatureMethod, SignatureRecord, SignerIdentity, Sha256Digest,
    TransparencyLogEntry, TrustStore,
};

use super::checksum;

/// Outcome of checking one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// Whether a recognized signature was present at all.
    pub signed: bool,
    /// Whether the signature verified and is trusted.
    pub valid: bool,
    /// Trust model that was checked.
    pub method: Option<SignatureMethod>,
    /// Key name or signer subject the signature is attributed to.
    pub identity: Option<String>,
    /// Human-readable explanation.
    pub detail: String,
}

impl VerificationResult {
    fn unsigned(detail: impl Into<String>) -> Self {
        Self {
            signed: false,
            valid: false,
            method: None,
            identity: None,
            detail: detail.into(),
        }
    }

    fn invalid(method: SignatureMethod, detail: impl Into<String>) -> Self {
        Self {
            signed: true,
            valid: false,
            method: Some(method),
            identity: None,
            detail: detail.into(),
        }
    }

    fn trusted(method: SignatureMethod, identity: String) -> Self {
        Self {
            signed: true,
            valid: true,
            method: Some(method),
            detail: format!("signed by {identity}"),
            identity: Some(identity),
        }
    }
}

/// One trust model.
pub trait SignatureVerifier: Send + Sync {
    /// The method tag this verifier handles.
    fn method(&self) -> SignatureMethod;

    /// Check `record` over `bytes` against the trust store.
    fn verify(&self, bytes: &[u8], record: &SignatureRecord, store: &TrustStore)
    -> VerificationResult;
}

/// Ed25519 signatures from registered keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyVerifier;

impl SignatureVerifier for KeyVerifier {
    fn method(&self) -> SignatureMethod {
        SignatureMethod::Ed25519
    }

    fn verify(
        &self,
        bytes: &[u8],
        record: &SignatureRecord,
        store: &TrustStore,
    ) -> VerificationResult {
        let method = self.method();
        let Some(key_id) = record.key_id.as_deref() else {
            return VerificationResult::invalid(method, "signature does not name a key");
        };
        let Some(encoded) = store.keys.get(key_id) else {
            return VerificationResult::invalid(method, format!("key '{key_id}' is not trusted"));
        };
        let checked = decode_key(encoded)
            .and_then(|key| decode_signature(&record.signature).map(|sig| (key, sig)))
            .and_then(|(key, sig)| {
                key.verify(bytes, &sig)
                    .map_err(|_| "signature does not match archive".to_string())
            });
        match checked {
            Ok(()) => VerificationResult::trusted(method, key_id.to_string()),
            Err(reason) => VerificationResult::invalid(method, reason),
        }
    }
}

/// Identity-based signatures anchored to a transparency log.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeylessVerifier;

impl SignatureVerifier for KeylessVerifier {
    fn method(&self) -> SignatureMethod {
        SignatureMethod::Keyless
    }

    fn verify(
        &self,
        bytes: &[u8],
        record: &SignatureRecord,
        store: &TrustStore,
    ) -> VerificationResult {
        let method = self.method();
        match verify_keyless(bytes, record, store) {
            Ok(signer) => VerificationResult::trusted(method, signer.subject.clone()),
            Err(reason) => VerificationResult::invalid(method, reason),
        }
    }
}

fn verify_keyless<'r>(
    bytes: &[u8],
    record: &'r SignatureRecord,
    store: &TrustStore,
) -> Result<&'r SignerIdentity, String> {
    let public_key = record
        .public_key
        .as_deref()
        .ok_or("keyless signature has no public key")?;
    let signer = record
        .signer
        .as_ref()
        .ok_or("keyless signature has no signer identity")?;
    let entry = record
        .log_entry
        .as_ref()
        .ok_or("keyless signature has no transparency log entry")?;

    let ephemeral = decode_key(public_key)?;
    let sig = decode_signature(&record.signature)?;
    ephemeral
        .verify(bytes, &sig)
        .map_err(|_| "signature does not match archive".to_string())?;

    let log_key = store
        .transparency_logs
        .get(&entry.log_id)
        .ok_or_else(|| format!("transparency log '{}' is not trusted", entry.log_id))?;
    let log_key = decode_key(log_key)?;
    let set = decode_signature(&entry.signed_entry_timestamp)?;
    let payload = log_entry_payload(&checksum(bytes), signer, public_key, entry);
    log_key
        .verify(&payload, &set)
        .map_err(|_| "transparency log entry does not verify".to_string())?;

    let trusted = store.signers.iter().any(|t| {
        t.issuer == signer.issuer
            && glob::Pattern::new(&t.subject).is_ok_and(|p| p.matches(&signer.subject))
    });
    if !trusted {
        return Err(format!("signer {signer} is not trusted"));
    }
    Ok(signer)
}

/// Canonical bytes a transparency log signs for a keyless entry.
pub fn log_entry_payload(
    digest: &Sha256Digest,
    signer: &SignerIdentity,
    public_key: &str,
    entry: &TransparencyLogEntry,
) -> Vec<u8> {
    format!(
        "plinth-log-entry:v1\n{}\n{}\n{}\n{digest}\n{}\n{}\n{public_key}",
        entry.log_id, entry.log_index, entry.integrated_time, signer.subject, signer.issuer,
    )
    .into_bytes()
}

/// Check an optional signature record over `bytes`.
///
/// A missing record, or one whose method this build does not recognize, is
/// reported as unsigned rather than invalid.
pub fn verify_signature(
    bytes: &[u8],
    record: Option<&SignatureRecord>,
    store: &TrustStore,
) -> VerificationResult {
    let Some(record) = record else {
        return VerificationResult::unsigned("no signature");
    };
    let verifiers: [&dyn SignatureVerifier; 2] = [&KeyVerifier, &KeylessVerifier];
    match verifiers.iter().find(|v| v.method() == record.method) {
        Some(verifier) => verifier.verify(bytes, record, store),
        None => VerificationResult::unsigned(format!(
            "unrecognized signature method '{}'",
            record.method
        )),
    }
}

/// Hold a trusted keyless signature to the signer its manifest declares.
///
/// Key-based and failed results pass through unchanged, as does everything
/// when the manifest has no `[trust]` section.
pub fn check_declared_signer(
    result: VerificationResult,
    declared: Option<&ManifestTrust>,
    record: Option<&SignatureRecord>,
) -> VerificationResult {
    let Some(declared) = declared else {
        return result;
    };
    let signer = record.and_then(|r| r.signer.as_ref());
    let (true, Some(SignatureMethod::Keyless), Some(signer)) = (result.valid, result.method, signer) else {
        return result;
    };
    let subject_matches = declared.signer.as_deref().is_none_or(|s| s == signer.subject);
    let issuer_matches = declared.issuer.as_deref().is_none_or(|i| i == signer.issuer);
    if subject_matches && issuer_matches {
        result
    } else {
        VerificationResult::invalid(
            SignatureMethod::Keyless,
            format!("signer {signer} is not the signer declared in the manifest"),
        )
    }
}

/// Produce a key-based signature record.
pub fn sign_with_key(bytes: &[u8], key_id: &str, key: &SigningKey) -> SignatureRecord {
    SignatureRecord {
        method: SignatureMethod::Ed25519,
        signature: STANDARD.encode(key.sign(bytes).to_bytes()),
        key_id: Some(key_id.to_string()),
        public_key: None,
        signer: None,
        log_entry: None,
    }
}

/// Produce a keyless signature record, with the log's entry timestamp.
///
/// `entry.signed_entry_timestamp` is overwritten with the log's signature.
pub fn sign_keyless(
    bytes: &[u8],
    signer: SignerIdentity,
    ephemeral: &SigningKey,
    log_key: &SigningKey,
    mut entry: TransparencyLogEntry,
) -> SignatureRecord {
    let public_key = STANDARD.encode(ephemeral.verifying_key().to_bytes());
    let payload = log_entry_payload(&checksum(bytes), &signer, &public_key, &entry);
    entry.signed_entry_timestamp = STANDARD.encode(log_key.sign(&payload).to_bytes());
    SignatureRecord {
        method: SignatureMethod::Keyless,
        signature: STANDARD.encode(ephemeral.sign(bytes).to_bytes()),
        key_id: None,
        public_key: Some(public_key),
        signer: Some(signer),
        log_entry: Some(entry),
    }
}

fn decode_key(encoded: &str) -> Result<VerifyingKey, String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| format!("bad public key encoding: {e}"))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| "public key must be 32 bytes".to_string())?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| format!("bad public key: {e}"))
}

fn decode_signature(encoded: &str) -> Result<Signature, String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| format!("bad signature encoding: {e}"))?;
    let bytes: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| "signature must be 64 bytes".to_string())?;
    Ok(Signature::from_bytes(&bytes))
}
