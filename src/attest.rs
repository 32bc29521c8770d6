//! Signed creation/deletion attestations.
//!
//! Each job that reaches a running sandbox produces two signed JSON
//! documents: a creation record when the container comes up and a deletion
//! record when it is destroyed. The signature is ed25519 over the SHA-256 of
//! the canonical payload with the `signature` field absent, so any holder of
//! the identity's public key can re-derive and check it.
//!
//! The `jobHash` embedded here is computed locally from the observed job
//! attributes; it is NOT the marketplace-supplied hash used in the
//! acceptance commitment.

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::Serialize;

use crate::error::{AttestError, SigningError};
use crate::identity::Identity;
use crate::signing;

pub const TYPE_CREATED: &str = "container:created";
pub const TYPE_DESTROYED: &str = "container:destroyed";
pub const TYPE_DESTROYED_TIMEOUT: &str = "container:destroyed:timeout";

/// Resource class recorded into the creation attestation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: f64,
}

/// Inputs for a creation attestation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationRecord {
    #[serde(rename = "type")]
    pub record_type: &'static str,
    pub job_id: String,
    pub container_id: String,
    pub agent_id: String,
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub job_hash: String,
    pub resource_limits: ResourceLimits,
    pub privacy_tier: String,
}

/// Inputs for a deletion attestation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionRecord {
    #[serde(rename = "type")]
    pub record_type: &'static str,
    pub job_id: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: DateTime<Utc>,
    pub data_volumes: Vec<String>,
    pub deletion_method: String,
    pub transcript_sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeletionRecord {
    /// Mark this record as a lifetime-timeout retirement.
    pub fn timeout(mut self) -> Self {
        self.record_type = TYPE_DESTROYED_TIMEOUT;
        self.reason = Some("timeout".to_string());
        self
    }
}

/// Locally computed canonical job hash for attestations.
pub fn local_job_hash(
    job_id: &str,
    description: &str,
    buyer: &str,
    amount: &str,
    currency: &str,
    timestamp: i64,
) -> Result<String, SigningError> {
    let payload = serde_json::json!({
        "jobId": job_id,
        "description": description,
        "buyer": buyer,
        "amount": amount,
        "currency": currency,
        "timestamp": timestamp,
    });
    Ok(hex::encode(signing::canonical_digest(&payload)?))
}

/// Sign a record: serialise, canonicalise without `signature`, embed the
/// hex signature.
pub fn sign_record<T: Serialize>(
    record: &T,
    identity: &Identity,
) -> Result<serde_json::Value, AttestError> {
    let mut payload = serde_json::to_value(record)?;
    let obj = payload
        .as_object_mut()
        .ok_or_else(|| AttestError::Signing(SigningError::InvalidSignature {
            reason: "attestation payload must be a JSON object".to_string(),
        }))?;
    obj.remove("signature");

    let signature = identity.signer().sign_canonical(&payload)?;
    payload
        .as_object_mut()
        .and_then(|o| o.insert("signature".to_string(), signature.into()));
    Ok(payload)
}

/// Verify a signed attestation against a public key.
pub fn verify_record(
    attestation: &serde_json::Value,
    key: &VerifyingKey,
) -> Result<(), SigningError> {
    let mut payload = attestation.clone();
    let signature = payload
        .as_object_mut()
        .and_then(|o| o.remove("signature"))
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .ok_or(SigningError::InvalidSignature {
            reason: "missing signature field".to_string(),
        })?;
    signing::verify_canonical(key, &payload, &signature)
}
