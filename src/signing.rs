//! Identity signing primitives.
//!
//! Every marketplace-visible commitment (job acceptance, delivery,
//! attestations) is signed with the assigned identity's ed25519 key. JSON
//! payloads are signed over their canonical serialisation: objects with
//! lexicographically sorted keys and no insignificant whitespace. Plain-text
//! protocol messages (`VAP-ACCEPT|…`, `VAP-DELIVER|…`) are signed over their
//! exact bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::SigningError;

/// Ed25519 signer bound to one identity.
pub struct IdentitySigner {
    signing_key: SigningKey,
}

impl std::fmt::Debug for IdentitySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySigner")
            .field("public_key", &hex::encode(self.verifying_key().to_bytes()))
            .finish()
    }
}

impl IdentitySigner {
    /// Build a signer from a 32-byte hex seed.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, SigningError> {
        let bytes = hex::decode(seed_hex.trim()).map_err(|e| SigningError::InvalidSeed {
            reason: e.to_string(),
        })?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SigningError::InvalidSeed {
                reason: format!("expected 32 bytes, got {}", bytes.len()),
            })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Sign raw message bytes; returns the signature hex-encoded.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Sign the SHA-256 digest of a canonical JSON payload.
    pub fn sign_canonical(&self, payload: &serde_json::Value) -> Result<String, SigningError> {
        let digest = canonical_digest(payload)?;
        Ok(hex::encode(self.signing_key.sign(&digest).to_bytes()))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Verify a hex signature over raw message bytes.
pub fn verify(key: &VerifyingKey, message: &[u8], signature_hex: &str) -> Result<(), SigningError> {
    let sig = decode_signature(signature_hex)?;
    key.verify(message, &sig)
        .map_err(|_| SigningError::VerifyFailed)
}

/// Verify a hex signature over the SHA-256 digest of a canonical payload.
pub fn verify_canonical(
    key: &VerifyingKey,
    payload: &serde_json::Value,
    signature_hex: &str,
) -> Result<(), SigningError> {
    let sig = decode_signature(signature_hex)?;
    let digest = canonical_digest(payload)?;
    key.verify(&digest, &sig)
        .map_err(|_| SigningError::VerifyFailed)
}

fn decode_signature(signature_hex: &str) -> Result<Signature, SigningError> {
    let bytes = hex::decode(signature_hex).map_err(|e| SigningError::InvalidSignature {
        reason: e.to_string(),
    })?;
    Signature::from_slice(&bytes).map_err(|e| SigningError::InvalidSignature {
        reason: e.to_string(),
    })
}

/// Canonical serialisation of a JSON value.
///
/// `serde_json::Value` objects are backed by a `BTreeMap`, so serialising a
/// value (or anything round-tripped through `to_value`) yields
/// lexicographically sorted keys. Compact form, no whitespace.
pub fn canonical_json(payload: &serde_json::Value) -> Result<String, SigningError> {
    Ok(serde_json::to_string(payload)?)
}

/// SHA-256 over the canonical serialisation.
pub fn canonical_digest(payload: &serde_json::Value) -> Result<[u8; 32], SigningError> {
    let canonical = canonical_json(payload)?;
    Ok(Sha256::digest(canonical.as_bytes()).into())
}

/// SHA-256 of arbitrary bytes, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The exact acceptance commitment the marketplace verifies.
pub fn accept_message(
    job_hash: &str,
    buyer: &str,
    amount: &str,
    currency: &str,
    unix_ts: i64,
) -> String {
    format!(
        "VAP-ACCEPT|Job:{job_hash}|Buyer:{buyer}|Amt:{amount} {currency}|Ts:{unix_ts}|I accept this job and commit to delivering the work."
    )
}

/// The delivery commitment over the result hash.
pub fn deliver_message(job_id: &str, result_sha256_hex: &str) -> String {
    format!("VAP-DELIVER|Job:{job_id}|Hash:{result_sha256_hex}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_signer() -> IdentitySigner {
        IdentitySigner::from_seed_hex(&hex::encode([7u8; 32])).unwrap()
    }

    #[test]
    fn seed_round_trip() {
        let signer = test_signer();
        let sig = signer.sign(b"hello");
        verify(&signer.verifying_key(), b"hello", &sig).unwrap();
    }

    #[test]
    fn bad_seed_rejected() {
        assert!(IdentitySigner::from_seed_hex("abcd").is_err());
        assert!(IdentitySigner::from_seed_hex("not hex").is_err());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let signer = test_signer();
        let sig = signer.sign(b"hello");
        let err = verify(&signer.verifying_key(), b"hellO", &sig).unwrap_err();
        assert!(matches!(err, SigningError::VerifyFailed));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let signer = test_signer();
        let other = IdentitySigner::from_seed_hex(&hex::encode([9u8; 32])).unwrap();
        let sig = signer.sign(b"payload");
        assert!(verify(&other.verifying_key(), b"payload", &sig).is_err());
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"zeta": 1, "alpha": {"nested_z": true, "nested_a": false}});
        let canonical = canonical_json(&value).unwrap();
        assert_eq!(
            canonical,
            r#"{"alpha":{"nested_a":false,"nested_z":true},"zeta":1}"#
        );
    }

    #[test]
    fn canonical_sign_verify_round_trip() {
        let signer = test_signer();
        let payload = json!({
            "type": "container:created",
            "jobId": "job-123",
            "createdAt": "2026-08-02T10:00:00Z",
        });
        let sig = signer.sign_canonical(&payload).unwrap();
        verify_canonical(&signer.verifying_key(), &payload, &sig).unwrap();

        let mut tampered = payload.clone();
        tampered["jobId"] = json!("job-124");
        assert!(verify_canonical(&signer.verifying_key(), &tampered, &sig).is_err());
    }

    #[test]
    fn accept_message_exact_format() {
        let msg = accept_message("abc123", "buyer@", "12.5", "VRSC", 1_760_000_000);
        assert_eq!(
            msg,
            "VAP-ACCEPT|Job:abc123|Buyer:buyer@|Amt:12.5 VRSC|Ts:1760000000|I accept this job and commit to delivering the work."
        );
    }

    #[test]
    fn accept_message_signature_verifies_byte_for_byte() {
        let signer = test_signer();
        let msg = accept_message("hash", "buyer@", "1", "VRSC", 1);
        let sig = signer.sign(msg.as_bytes());
        // Reconstructing from the same fields must produce the same bytes.
        let reconstructed = accept_message("hash", "buyer@", "1", "VRSC", 1);
        verify(&signer.verifying_key(), reconstructed.as_bytes(), &sig).unwrap();
    }

    #[test]
    fn deliver_message_format() {
        assert_eq!(
            deliver_message("job-1", "deadbeef"),
            "VAP-DELIVER|Job:job-1|Hash:deadbeef"
        );
    }
}
