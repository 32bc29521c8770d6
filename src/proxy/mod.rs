//! Credential-swapping proxy.
//!
//! Sandboxes never hold real provider keys. Each container gets a random
//! bearer token scoped to this loopback HTTP server; the proxy validates
//! the token on every request, applies a per-token rate window, and
//! forwards to the upstream provider with the real key substituted in.
//!
//! ```text
//! ┌─────────────┐  Bearer <container token>   ┌──────────┐  Bearer <real key>
//! │  sandbox    │ ───────────────────────────▶│  proxy   │ ──────────────────▶ upstream
//! │ (container) │ ◀─────────────────────────── │ 127.0.0.1│ ◀────────────────── provider
//! └─────────────┘   verbatim status + body    └──────────┘
//! ```
//!
//! Requests whose path contains `/embeddings/` are routed to the embeddings
//! provider with that prefix stripped; everything else goes verbatim to the
//! primary LLM provider.

mod registry;

pub use registry::{AuthOutcome, TokenRegistry};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::ExposeSecret;

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Request bodies are capped; anything larger is rejected with 413.
const MAX_BODY_BYTES: usize = 100 * 1024;

/// Shared proxy state.
#[derive(Clone)]
pub struct ProxyState {
    pub registry: TokenRegistry,
    config: Arc<ProxyConfig>,
    http: reqwest::Client,
}

impl ProxyState {
    pub fn new(registry: TokenRegistry, config: ProxyConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            http: reqwest::Client::new(),
        }
    }
}

/// Build the proxy router.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(forward)
        .with_state(state)
}

/// Start the proxy on loopback. Runs until the process exits.
pub async fn start(state: ProxyState, port: u16) -> Result<(), ProxyError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Bind {
            port,
            reason: e.to_string(),
        })?;

    tracing::info!("Credential proxy listening on {}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| ProxyError::Server {
            reason: e.to_string(),
        })
}

async fn health(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "tokens": state.registry.len().await,
    }))
}

/// Which upstream a request resolves to.
#[derive(Debug, PartialEq, Eq)]
enum Upstream {
    Llm,
    Embeddings,
}

/// Route a path: `/embeddings/` requests go to the embeddings provider with
/// the prefix segment stripped; everything else goes to the LLM provider
/// verbatim.
fn route_path(path: &str) -> (Upstream, String) {
    if path.contains("/embeddings/") {
        (Upstream::Embeddings, path.replacen("/embeddings/", "/", 1))
    } else {
        (Upstream::Llm, path.to_string())
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

async fn forward(State(state): State<ProxyState>, req: Request) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }

    let Some(token) = bearer_token(&req) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing bearer token");
    };

    // Registration is re-checked on every call; revoked tokens die here.
    let job_id = match state
        .registry
        .authorize(&token, state.config.rate_limit)
        .await
    {
        AuthOutcome::Ok { job_id } => job_id,
        AuthOutcome::UnknownToken => {
            return error_response(StatusCode::UNAUTHORIZED, "unknown token");
        }
        AuthOutcome::RateLimited { retry_after } => {
            let mut resp = error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            if let Ok(v) = retry_after.as_secs().to_string().parse() {
                resp.headers_mut().insert("Retry-After", v);
            }
            return resp;
        }
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let (upstream, upstream_path) = route_path(parts.uri.path());
    let (base, key) = match upstream {
        Upstream::Llm => (&state.config.llm_base_url, &state.config.llm_api_key),
        Upstream::Embeddings => (
            &state.config.embeddings_base_url,
            &state.config.embeddings_api_key,
        ),
    };

    let mut url = format!("{base}{upstream_path}");
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);

    let mut upstream_req = state
        .http
        .request(method, &url)
        .header("Authorization", format!("Bearer {}", key.expose_secret()))
        .body(bytes.to_vec());
    if let Some(ct) = parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        upstream_req = upstream_req.header("Content-Type", ct);
    }

    let upstream_resp = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    // Relay status and body verbatim.
    let status = StatusCode::from_u16(upstream_resp.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream_resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body = match upstream_resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Failed reading upstream body");
            return error_response(StatusCode::BAD_GATEWAY, "upstream body read failed");
        }
    };

    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": { "message": message }
        })),
    )
        .into_response()
}
