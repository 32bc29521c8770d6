//! Configuration for the dispatcher.
//!
//! All settings come from environment variables (a local `.env` is loaded
//! via dotenvy early in startup). Each section has a `resolve()` that reads
//! its own variables; `Config::from_env()` assembles the sections and then
//! validates cross-field invariants, reporting every problem at once so a
//! broken deployment fails with one actionable message.

pub(crate) mod helpers;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

use self::helpers::{
    optional_env, parse_millis_env, parse_optional_env, parse_secs_env, parse_string_env,
    require_env,
};

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub market: MarketConfig,
    pub dispatch: DispatchConfig,
    pub container: ContainerConfig,
    pub proxy: ProxyConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let config = Self {
            market: MarketConfig::resolve()?,
            dispatch: DispatchConfig::resolve()?,
            container: ContainerConfig::resolve()?,
            proxy: ProxyConfig::resolve()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation. Collects all problems before failing.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.container.port_range_start > self.container.port_range_end {
            problems.push(format!(
                "PORT_RANGE_START ({}) > PORT_RANGE_END ({})",
                self.container.port_range_start, self.container.port_range_end
            ));
        }
        if self.container.port_range_start <= self.proxy.port
            && self.proxy.port <= self.container.port_range_end
        {
            problems.push(format!(
                "PROXY_PORT ({}) falls inside the container port range",
                self.proxy.port
            ));
        }
        if self.dispatch.max_accepts_per_minute == 0 {
            problems.push("MAX_ACCEPTS_PER_MIN must be at least 1".to_string());
        }
        if self.container.cpus <= 0.0 {
            problems.push("CONTAINER_CPUS must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems.join("; ")))
        }
    }
}

/// Marketplace API and identity store settings.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Marketplace API origin, e.g. `https://market.example.net`.
    pub api_base: String,
    /// Directory holding one subdirectory per provisioned identity.
    pub agents_dir: PathBuf,
    /// Fallback single-identity key file (used when `agents_dir` is empty).
    pub keys_file: Option<PathBuf>,
}

impl MarketConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: require_env("VAP_API")?.trim_end_matches('/').to_string(),
            agents_dir: PathBuf::from(parse_string_env("AGENTS_DIR", "./agents")),
            keys_file: optional_env("VAP_KEYS_FILE").map(PathBuf::from),
        })
    }
}

/// Admission and routing settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How often the marketplace is polled for `requested` jobs.
    pub poll_interval: Duration,
    /// Acceptance rate cap over a 60-second sliding window.
    pub max_accepts_per_minute: u32,
    /// Maximum number of admitted jobs waiting for a container.
    pub max_queued_jobs: usize,
    /// Retire a ready container that never received a buyer message.
    pub ghost_timeout: Duration,
    /// Root directory for per-job state (logs, attestations).
    pub jobs_path: PathBuf,
    /// Optional read-only document corpus mounted into sandboxes.
    pub wiki_path: Option<PathBuf>,
}

impl DispatchConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            poll_interval: parse_secs_env("POLL_INTERVAL", 15)?,
            max_accepts_per_minute: parse_optional_env("MAX_ACCEPTS_PER_MIN", 3)?,
            max_queued_jobs: parse_optional_env("MAX_QUEUED_JOBS", 4)?,
            ghost_timeout: parse_secs_env("GHOST_TIMEOUT", 300)?,
            jobs_path: PathBuf::from(parse_string_env("JOBS_PATH", "./jobs")),
            wiki_path: optional_env("WIKI_PATH").map(PathBuf::from),
        })
    }
}

/// Container runtime settings.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Docker image for job sandboxes.
    pub image: String,
    /// First host port handed to sandboxes.
    pub port_range_start: u16,
    /// Last host port handed to sandboxes (inclusive).
    pub port_range_end: u16,
    /// Delay before a released port may be reused.
    pub port_cooldown: Duration,
    /// Memory cap per container, in megabytes.
    pub memory_limit_mb: u64,
    /// CPU cap per container (fractional cores).
    pub cpus: f64,
    /// Hard wall-clock lifetime per container.
    pub max_lifetime: Duration,
    /// Model name sent in sandbox chat-completion requests.
    pub model: String,
}

impl ContainerConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            image: parse_string_env("CONTAINER_IMAGE", "vap-sandbox:latest"),
            port_range_start: parse_optional_env("PORT_RANGE_START", 42000)?,
            port_range_end: parse_optional_env("PORT_RANGE_END", 42007)?,
            port_cooldown: parse_millis_env("PORT_COOLDOWN", 30_000)?,
            memory_limit_mb: parse_optional_env("CONTAINER_MEMORY", 2048)?,
            cpus: parse_optional_env("CONTAINER_CPUS", 1.0)?,
            max_lifetime: parse_secs_env("CONTAINER_MAX_LIFETIME", 3600)?,
            model: parse_string_env("CONTAINER_MODEL", "default"),
        })
    }

    /// Number of ports in the configured range.
    pub fn pool_size(&self) -> usize {
        (self.port_range_end - self.port_range_start) as usize + 1
    }
}

/// Credential proxy settings.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Loopback port the proxy listens on.
    pub port: u16,
    /// Per-token upstream requests per 60-second window.
    pub rate_limit: u32,
    /// Primary LLM provider base URL.
    pub llm_base_url: String,
    /// Primary LLM provider API key.
    pub llm_api_key: SecretString,
    /// Embeddings provider base URL (defaults to the LLM provider).
    pub embeddings_base_url: String,
    /// Embeddings provider API key (defaults to the LLM key).
    pub embeddings_api_key: SecretString,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("port", &self.port)
            .field("rate_limit", &self.rate_limit)
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_api_key", &"[REDACTED]")
            .field("embeddings_base_url", &self.embeddings_base_url)
            .field("embeddings_api_key", &"[REDACTED]")
            .finish()
    }
}

impl ProxyConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let llm_base_url = parse_string_env("LLM_API_BASE", "https://api.openai.com")
            .trim_end_matches('/')
            .to_string();
        let llm_api_key = SecretString::from(require_env("LLM_API_KEY")?);
        let embeddings_base_url = optional_env("EMBEDDINGS_API_BASE")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| llm_base_url.clone());
        let embeddings_api_key = optional_env("EMBEDDINGS_API_KEY")
            .map(SecretString::from)
            .unwrap_or_else(|| llm_api_key.clone());

        Ok(Self {
            port: parse_optional_env("PROXY_PORT", 41300)?,
            rate_limit: parse_optional_env("PROXY_RATE_LIMIT", 60)?,
            llm_base_url,
            llm_api_key,
            embeddings_base_url,
            embeddings_api_key,
        })
    }
}
