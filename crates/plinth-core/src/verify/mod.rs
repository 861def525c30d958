//! Integrity, signature, and trust-policy checks.
//!
//! Backends never verify what they hand out; everything in here runs in the
//! engine, after fetch and before an archive is admitted to the cache.

mod policy;
mod signature;

pub use policy::{CompiledPolicy, PolicyDecision, PolicyViolation, SignatureStatus, evaluate_policy};
pub use signature::{
    KeyVerifier, KeylessVerifier, SignatureVerifier, VerificationResult, check_declared_signer,
    log_entry_payload, sign_keyless, sign_with_key, verify_signature,
};

use plinth_schema::Sha256Digest;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::Result;

/// SHA-256 of a byte slice.
pub fn checksum(bytes: &[u8]) -> Sha256Digest {
    Sha256Digest::from_bytes(Sha256::digest(bytes).into())
}

/// Whether `bytes` hash to `expected`.
pub fn verify_checksum(bytes: &[u8], expected: &Sha256Digest) -> bool {
    &checksum(bytes) == expected
}

/// Stream a file through SHA-256, returning the digest and byte count.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub async fn checksum_file(path: &Path) -> Result<(Sha256Digest, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Sha256Digest::from_bytes(hasher.finalize().into()), total))
}
