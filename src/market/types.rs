//! Marketplace wire types.

use serde::{Deserialize, Deserializer};

/// Job status as reported by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Requested,
    Accepted,
    InProgress,
    Delivered,
    #[serde(other)]
    Other,
}

impl JobStatus {
    /// Query-string form used by `/v1/me/jobs?status=...`.
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Delivered => "delivered",
            Self::Other => "other",
        }
    }
}

/// A marketplace job as observed from the API.
///
/// `job_hash` is the marketplace-supplied canonical hash used in the
/// acceptance commitment. It is distinct from the locally computed hash
/// embedded in attestations.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    #[serde(rename = "jobId", alias = "id")]
    pub job_id: String,
    #[serde(rename = "jobHash", default)]
    pub job_hash: String,
    #[serde(rename = "buyerVerusId", default)]
    pub buyer_verus_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub amount: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub description: String,
    pub status: JobStatus,
}

/// Standard `{data: ...}` envelope on marketplace responses.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: T,
}

/// Amounts arrive either as JSON numbers or strings; keep the exact textual
/// form so signed messages reproduce it byte-for-byte.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for amount, got {other}"
        ))),
    }
}
