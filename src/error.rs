//! Error types for the dispatcher.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Marketplace error: {0}")]
    Market(#[from] MarketError),

    #[error("Chat transport error: {0}")]
    Chat(#[from] ChatError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Job log error: {0}")]
    JobLog(#[from] JobLogError),

    #[error("Attestation error: {0}")]
    Attest(#[from] AttestError),
}

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity store errors.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to read key file {path}: {reason}")]
    KeyFile { path: String, reason: String },

    #[error("Key file {path} has mode {mode:o}, expected 0600")]
    Permissions { path: String, mode: u32 },

    #[error("Identity pool is empty (no usable keys under the agents directory)")]
    PoolEmpty,

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),
}

/// Signing and verification errors.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Invalid secret seed: {reason}")]
    InvalidSeed { reason: String },

    #[error("Invalid signature encoding: {reason}")]
    InvalidSignature { reason: String },

    #[error("Signature verification failed")]
    VerifyFailed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Marketplace HTTP errors.
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("Authentication failed for identity {identity}")]
    AuthFailed { identity: String },

    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("Unexpected response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Chat transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Failed to connect to chat transport: {reason}")]
    ConnectFailed { reason: String },

    #[error("Chat transport disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Failed to send chat message for job {job_id}: {reason}")]
    SendFailed { job_id: String, reason: String },

    #[error("Invalid chat event: {0}")]
    InvalidEvent(String),
}

/// Container manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Container start failed for job {job_id}: {reason}")]
    StartFailed { job_id: String, reason: String },

    #[error("No container found on port {port}")]
    NotFound { port: u16 },

    #[error("Container for job {job_id} failed health check after {waited:?}")]
    HealthTimeout { job_id: String, waited: Duration },

    #[error("Sandbox request on port {port} failed: {reason}")]
    RequestFailed { port: u16, reason: String },

    #[error("Sandbox reply on port {port} had no message content")]
    EmptyReply { port: u16 },

    #[error("Docker error: {reason}")]
    Docker { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential proxy errors (server-side; request rejections map straight
/// to HTTP status codes in the handlers).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to bind proxy listener on port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Proxy server error: {reason}")]
    Server { reason: String },
}

/// Per-job log errors.
#[derive(Debug, thiserror::Error)]
pub enum JobLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Attestation errors.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the dispatcher.
pub type Result<T> = std::result::Result<T, Error>;
