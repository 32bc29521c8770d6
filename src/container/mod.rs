//! Container lifecycle management for job sandboxes.
//!
//! One Docker container per admitted job, bound to one host port from the
//! configured range. The manager owns the port pool, generates the
//! per-container bearer token, registers it at the credential proxy before
//! the health probe starts, and revokes it before the container is stopped.

pub mod ports;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::ContainerConfig;
use crate::error::ContainerError;
use crate::identity::Identity;
use crate::joblog::JobStore;
use crate::proxy::TokenRegistry;

use self::ports::PortPool;

/// Port the sandbox process listens on inside the container.
const SANDBOX_PORT: u16 = 8080;

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(2);
const HEALTH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A running sandbox bound to one job.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub job_id: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    // Token is needed for health probes and chat calls; it is never logged.
    token: String,
}

/// What `start` hands back to the dispatcher.
#[derive(Debug, Clone)]
pub struct StartedContainer {
    pub port: u16,
    pub container_id: String,
    pub token: String,
}

/// Manages sandbox containers and the host port pool.
pub struct ContainerManager {
    config: ContainerConfig,
    proxy_port: u16,
    wiki_path: Option<PathBuf>,
    store: JobStore,
    registry: TokenRegistry,
    ports: Mutex<PortPool>,
    containers: RwLock<HashMap<u16, ContainerRecord>>,
    /// Cached Docker connection (created on first use).
    docker: RwLock<Option<bollard::Docker>>,
    http: reqwest::Client,
}

impl ContainerManager {
    pub fn new(
        config: ContainerConfig,
        proxy_port: u16,
        wiki_path: Option<PathBuf>,
        store: JobStore,
        registry: TokenRegistry,
    ) -> Self {
        let ports = PortPool::new(
            config.port_range_start,
            config.port_range_end,
            config.port_cooldown,
        );
        Self {
            config,
            proxy_port,
            wiki_path,
            store,
            registry,
            ports: Mutex::new(ports),
            containers: RwLock::new(HashMap::new()),
            docker: RwLock::new(None),
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<bollard::Docker, ContainerError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker =
            bollard::Docker::connect_with_local_defaults().map_err(|e| ContainerError::Docker {
                reason: e.to_string(),
            })?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    /// Start a sandbox for a job.
    ///
    /// Returns `Ok(None)` when no port is free (the caller queues the job).
    /// The bearer token is registered at the proxy before this returns, so
    /// health probing can authenticate immediately.
    pub async fn start(
        &self,
        job_id: &str,
        identity: &Identity,
    ) -> Result<Option<StartedContainer>, ContainerError> {
        let port = match self.ports.lock().await.allocate(job_id) {
            Some(port) => port,
            None => return Ok(None),
        };

        let token = generate_token();
        self.registry.register(&token, job_id).await;

        match self.start_inner(job_id, identity, port, &token).await {
            Ok(container_id) => {
                let record = ContainerRecord {
                    job_id: job_id.to_string(),
                    container_id: container_id.clone(),
                    created_at: Utc::now(),
                    token: token.clone(),
                };
                self.containers.write().await.insert(port, record);

                tracing::info!(job_id, port, "Started sandbox container");
                Ok(Some(StartedContainer {
                    port,
                    container_id,
                    token,
                }))
            }
            Err(e) => {
                // Unwind: no token, no sandbox tree, port into cooldown.
                self.registry.revoke(&token).await;
                let _ = self.store.wipe_sandbox(job_id);
                self.ports.lock().await.release(port);
                Err(e)
            }
        }
    }

    /// Inner container creation (separated so `start` can unwind cleanly).
    async fn start_inner(
        &self,
        job_id: &str,
        identity: &Identity,
        port: u16,
        token: &str,
    ) -> Result<String, ContainerError> {
        let sandbox_dir = self.store.sandbox_dir(job_id);
        let proxy_url = format!("http://host.docker.internal:{}", self.proxy_port);
        write_sandbox_tree(
            &sandbox_dir,
            &proxy_url,
            token,
            &self.config.model,
            identity.soul.as_deref(),
        )?;

        let docker = self.docker().await?;

        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::{HostConfig, PortBinding};

        let env = vec![
            format!("VAP_JOB_ID={}", job_id),
            format!("VAP_PROXY_URL={}", proxy_url),
            format!("VAP_SANDBOX_TOKEN={}", token),
            format!("PORT={}", SANDBOX_PORT),
        ];

        let mut binds = vec![format!("{}:/etc/sandbox:ro", sandbox_dir.display())];
        if let Some(ref wiki) = self.wiki_path {
            binds.push(format!("{}:/wiki:ro", wiki.display()));
        }

        let port_key = format!("{}/tcp", SANDBOX_PORT);
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = [(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(port.to_string()),
            }]),
        )]
        .into_iter()
        .collect();

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            memory: Some((self.config.memory_limit_mb * 1024 * 1024) as i64),
            nano_cpus: Some((self.config.cpus * 1_000_000_000.0) as i64),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(
                [
                    ("/tmp".to_string(), "size=256M".to_string()),
                    ("/var/cache".to_string(), "size=64M".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            env: Some(env),
            exposed_ports: Some([(port_key, HashMap::new())].into_iter().collect()),
            host_config: Some(host_config),
            user: Some("1000:1000".to_string()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("vap-sandbox-{}", sanitize_name(job_id)),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| ContainerError::StartFailed {
                job_id: job_id.to_string(),
                reason: e.to_string(),
            })?;
        let container_id = response.id;

        docker
            .start_container::<String>(&container_id, None)
            .await
            .map_err(|e| ContainerError::StartFailed {
                job_id: job_id.to_string(),
                reason: format!("failed to start container: {}", e),
            })?;

        Ok(container_id)
    }

    /// Probe the sandbox with authenticated trivial completions until it
    /// answers 2xx or the overall timeout elapses.
    pub async fn wait_for_health(&self, port: u16) -> Result<(), ContainerError> {
        let record = self.record(port).await.ok_or(ContainerError::NotFound { port })?;
        let url = format!("http://127.0.0.1:{port}/v1/chat/completions");
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });

        let started = Instant::now();
        loop {
            let attempt = self
                .http
                .post(&url)
                .bearer_auth(&record.token)
                .timeout(HEALTH_ATTEMPT_TIMEOUT)
                .json(&body)
                .send()
                .await;

            match attempt {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    tracing::debug!(port, status = %resp.status(), "Sandbox not healthy yet");
                }
                Err(e) => {
                    tracing::debug!(port, error = %e, "Sandbox health probe failed");
                }
            }

            if started.elapsed() >= HEALTH_TIMEOUT {
                return Err(ContainerError::HealthTimeout {
                    job_id: record.job_id.clone(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
        }
    }

    /// Send one buyer turn into the sandbox and extract the reply text.
    pub async fn send_request(&self, port: u16, message: &str) -> Result<String, ContainerError> {
        let record = self.record(port).await.ok_or(ContainerError::NotFound { port })?;
        let url = format!("http://127.0.0.1:{port}/v1/chat/completions");
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": message}],
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&record.token)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| ContainerError::RequestFailed {
                port,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ContainerError::RequestFailed {
                port,
                reason: format!("sandbox returned status {}", resp.status()),
            });
        }

        let completion: ChatCompletion =
            resp.json().await.map_err(|e| ContainerError::RequestFailed {
                port,
                reason: format!("invalid completion body: {e}"),
            })?;
        extract_reply(completion).ok_or(ContainerError::EmptyReply { port })
    }

    /// Destroy the sandbox on a port.
    ///
    /// The proxy token is revoked before the runtime stop, the generated
    /// config tree is wiped, and the port goes into cooldown.
    pub async fn destroy(&self, port: u16) -> Result<ContainerRecord, ContainerError> {
        let record = self
            .containers
            .write()
            .await
            .remove(&port)
            .ok_or(ContainerError::NotFound { port })?;

        self.registry.revoke(&record.token).await;

        match self.docker().await {
            Ok(docker) => {
                if let Err(e) = docker
                    .stop_container(
                        &record.container_id,
                        Some(bollard::container::StopContainerOptions { t: 5 }),
                    )
                    .await
                {
                    tracing::warn!(port, error = %e, "Failed to stop container (may already be stopped)");
                }
                if let Err(e) = docker
                    .remove_container(
                        &record.container_id,
                        Some(bollard::container::RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
                {
                    tracing::warn!(port, error = %e, "Failed to remove container (may require manual cleanup)");
                }
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "No Docker connection for container cleanup");
            }
        }

        if let Err(e) = self.store.wipe_sandbox(&record.job_id) {
            tracing::warn!(job_id = %record.job_id, error = %e, "Failed to wipe sandbox config tree");
        }
        self.ports.lock().await.release(port);

        tracing::info!(job_id = %record.job_id, port, "Destroyed sandbox container");
        Ok(record)
    }

    /// In-use ports whose container exceeded the maximum lifetime.
    pub async fn expired(&self) -> Vec<(u16, String)> {
        self.ports.lock().await.expired(self.config.max_lifetime)
    }

    /// Return cooled-down ports to the free set.
    pub async fn sweep_cooldown(&self) {
        self.ports.lock().await.sweep();
    }

    pub async fn record(&self, port: u16) -> Option<ContainerRecord> {
        self.containers.read().await.get(&port).cloned()
    }

    pub async fn in_use_len(&self) -> usize {
        self.ports.lock().await.in_use_len()
    }

    pub async fn free_len(&self) -> usize {
        self.ports.lock().await.free_len()
    }

    /// Mount paths visible to the sandbox, for deletion attestations.
    pub fn data_volumes(&self) -> Vec<String> {
        let mut volumes = vec!["/etc/sandbox".to_string(), "/tmp".to_string()];
        if self.wiki_path.is_some() {
            volumes.push("/wiki".to_string());
        }
        volumes
    }
}

/// 32 random bytes, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Docker names allow `[a-zA-Z0-9_.-]`; job ids are opaque strings.
fn sanitize_name(job_id: &str) -> String {
    job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Write the generated config tree the sandbox reads at startup: a client
/// config pointing at the credential proxy, plus the identity persona.
fn write_sandbox_tree(
    dir: &std::path::Path,
    proxy_url: &str,
    token: &str,
    model: &str,
    soul: Option<&str>,
) -> Result<(), ContainerError> {
    std::fs::create_dir_all(dir)?;
    let client = serde_json::json!({
        "base_url": proxy_url,
        "api_key": token,
        "embeddings_path_prefix": "/embeddings",
        "model": model,
    });
    std::fs::write(
        dir.join("client.json"),
        serde_json::to_vec_pretty(&client).unwrap_or_default(),
    )?;
    if let Some(soul) = soul {
        std::fs::write(dir.join("SOUL.md"), soul)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn extract_reply(completion: ChatCompletion) -> Option<String> {
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_32_bytes_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(hex::decode(&token).is_ok());
        assert_ne!(token, generate_token());
    }

    #[test]
    fn sanitize_keeps_docker_safe_chars() {
        assert_eq!(sanitize_name("job-123"), "job-123");
        assert_eq!(sanitize_name("job/123:x"), "job-123-x");
        assert_eq!(sanitize_name("a.b_c"), "a.b_c");
    }

    #[test]
    fn sandbox_tree_contains_client_config() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path().join("sandbox");
        write_sandbox_tree(
            &sandbox,
            "http://host.docker.internal:41300",
            "deadbeef",
            "default",
            Some("You are a helpful agent."),
        )
        .unwrap();

        let raw = std::fs::read_to_string(sandbox.join("client.json")).unwrap();
        let client: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(client["base_url"], "http://host.docker.internal:41300");
        assert_eq!(client["api_key"], "deadbeef");
        assert_eq!(client["model"], "default");
        assert_eq!(
            std::fs::read_to_string(sandbox.join("SOUL.md")).unwrap(),
            "You are a helpful agent."
        );
    }

    #[test]
    fn extract_reply_takes_first_choice() {
        let completion: ChatCompletion = serde_json::from_value(serde_json::json!({
            "choices": [
                {"message": {"role": "assistant", "content": "first"}},
                {"message": {"role": "assistant", "content": "second"}},
            ]
        }))
        .unwrap();
        assert_eq!(extract_reply(completion).as_deref(), Some("first"));
    }

    #[test]
    fn missing_or_empty_content_is_an_error() {
        let no_choices: ChatCompletion = serde_json::from_value(serde_json::json!({
            "choices": []
        }))
        .unwrap();
        assert!(extract_reply(no_choices).is_none());

        let empty: ChatCompletion = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": ""}}]
        }))
        .unwrap();
        assert!(extract_reply(empty).is_none());

        let null: ChatCompletion = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"role": "assistant"}}]
        }))
        .unwrap();
        assert!(extract_reply(null).is_none());
    }
}
