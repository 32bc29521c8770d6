//! Marketplace HTTP client with challenge-based login.
//!
//! Authentication is a signed challenge exchanged for a `verus_session`
//! cookie. Expired sessions surface as 401; every authed call re-logs-in and
//! re-issues exactly once before giving up.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::SET_COOKIE;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::MarketError;
use crate::identity::Identity;
use crate::market::types::{Envelope, Job, JobStatus};
use crate::signing;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct Challenge {
    challenge: String,
    #[serde(rename = "challengeId")]
    challenge_id: String,
}

#[derive(Deserialize)]
struct ChatToken {
    token: String,
}

/// Marketplace client bound to one identity and its session.
pub struct MarketClient {
    http: reqwest::Client,
    base: String,
    identity: Arc<Identity>,
    /// Raw `verus_session=<v>` pair, kept for the chat transport handshake.
    session_cookie: RwLock<Option<String>>,
}

impl MarketClient {
    pub fn new(api_base: &str, identity: Arc<Identity>) -> Result<Self, MarketError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base: api_base.trim_end_matches('/').to_string(),
            identity,
            session_cookie: RwLock::new(None),
        })
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// The session cookie pair (`verus_session=...`) for transports that
    /// attach it to their own handshake. `None` before the first login.
    pub async fn session_cookie(&self) -> Option<String> {
        self.session_cookie.read().await.clone()
    }

    /// Perform the challenge login and store the session cookie.
    pub async fn login(&self) -> Result<(), MarketError> {
        let endpoint = format!("{}/auth/challenge", self.base);
        let challenge: Envelope<Challenge> = self
            .http
            .get(&endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let signature = self
            .identity
            .signer()
            .sign(challenge.data.challenge.as_bytes());

        let resp = self
            .http
            .post(format!("{}/auth/login", self.base))
            .json(&serde_json::json!({
                "challengeId": challenge.data.challenge_id,
                "verusId": self.identity.identity_name,
                "signature": signature,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(MarketError::AuthFailed {
                identity: self.identity.identity_name.clone(),
            });
        }

        if let Some(cookie) = extract_session_cookie(resp.headers()) {
            *self.session_cookie.write().await = Some(cookie);
        }

        tracing::info!(identity = %self.identity.identity_name, "Marketplace login ok");
        Ok(())
    }

    /// Issue a request, re-logging-in and retrying exactly once on 401.
    async fn send_authed<F>(
        &self,
        endpoint: &str,
        build: F,
    ) -> Result<reqwest::Response, MarketError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        for attempt in 0..2u8 {
            let resp = build(&self.http).send().await?;
            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                tracing::debug!(
                    identity = %self.identity.identity_name,
                    endpoint,
                    "Session rejected, re-authenticating once"
                );
                self.login().await?;
                continue;
            }
            if !status.is_success() {
                return Err(MarketError::Status {
                    endpoint: endpoint.to_string(),
                    status: status.as_u16(),
                });
            }
            return Ok(resp);
        }

        Err(MarketError::AuthFailed {
            identity: self.identity.identity_name.clone(),
        })
    }

    /// Jobs assigned to this identity in the seller role, by status.
    pub async fn my_jobs(&self, status: JobStatus) -> Result<Vec<Job>, MarketError> {
        let endpoint = format!(
            "{}/v1/me/jobs?status={}&role=seller",
            self.base,
            status.as_query()
        );
        let resp = self
            .send_authed(&endpoint, |http| http.get(&endpoint))
            .await?;
        let envelope: Envelope<Vec<Job>> = resp.json().await?;
        Ok(envelope.data)
    }

    /// Fetch a single job.
    pub async fn job(&self, job_id: &str) -> Result<Job, MarketError> {
        let endpoint = format!("{}/v1/jobs/{}", self.base, job_id);
        let resp = self
            .send_authed(&endpoint, |http| http.get(&endpoint))
            .await?;
        let envelope: Envelope<Job> = resp.json().await?;
        Ok(envelope.data)
    }

    /// Send the signed acceptance commitment for a job.
    ///
    /// The signature covers the exact `VAP-ACCEPT|…` message built from the
    /// marketplace-supplied `job_hash` and the current unix second.
    pub async fn accept_job(&self, job: &Job) -> Result<(), MarketError> {
        let timestamp = chrono::Utc::now().timestamp();
        let message = signing::accept_message(
            &job.job_hash,
            &job.buyer_verus_id,
            &job.amount,
            &job.currency,
            timestamp,
        );
        let signature = self.identity.signer().sign(message.as_bytes());

        let endpoint = format!("{}/v1/jobs/{}/accept", self.base, job.job_id);
        self.send_authed(&endpoint, |http| {
            http.post(&endpoint).json(&serde_json::json!({
                "timestamp": timestamp,
                "signature": signature,
            }))
        })
        .await?;

        tracing::info!(job_id = %job.job_id, identity = %self.identity.identity_name, "Accepted job");
        Ok(())
    }

    /// Deliver the result hash for a job.
    pub async fn deliver(&self, job_id: &str, result_sha256_hex: &str) -> Result<(), MarketError> {
        let message = signing::deliver_message(job_id, result_sha256_hex);
        let signature = self.identity.signer().sign(message.as_bytes());

        let endpoint = format!("{}/v1/jobs/{}/deliver", self.base, job_id);
        self.send_authed(&endpoint, |http| {
            http.post(&endpoint).json(&serde_json::json!({
                "resultHash": result_sha256_hex,
                "signature": signature,
            }))
        })
        .await?;
        Ok(())
    }

    /// Submit a signed attestation document. Best-effort at call sites:
    /// failures are logged and never block retirement.
    pub async fn submit_attestation(
        &self,
        job_id: &str,
        attestation: &serde_json::Value,
    ) -> Result<(), MarketError> {
        let endpoint = format!("{}/v1/jobs/{}/attestations", self.base, job_id);
        self.send_authed(&endpoint, |http| http.post(&endpoint).json(attestation))
            .await?;
        Ok(())
    }

    /// Short-lived token for the chat transport handshake.
    pub async fn chat_token(&self) -> Result<String, MarketError> {
        let endpoint = format!("{}/v1/chat/token", self.base);
        let resp = self
            .send_authed(&endpoint, |http| http.get(&endpoint))
            .await?;
        let envelope: Envelope<ChatToken> = resp.json().await?;
        Ok(envelope.data.token)
    }
}

fn extract_session_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("verus_session="))
        .map(|v| v.split(';').next().unwrap_or(v).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_extracted_from_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.append(SET_COOKIE, "other=1; Path=/".parse().unwrap());
        headers.append(
            SET_COOKIE,
            "verus_session=abc123; HttpOnly; Path=/".parse().unwrap(),
        );
        assert_eq!(
            extract_session_cookie(&headers).as_deref(),
            Some("verus_session=abc123")
        );
    }

    #[test]
    fn missing_session_cookie_is_none() {
        let headers = reqwest::header::HeaderMap::new();
        assert!(extract_session_cookie(&headers).is_none());
    }
}
