//! Dispatcher core.
//!
//! Owns the active-job table and queue, and runs the three long-lived
//! activities: the marketplace poller (admission), the lifecycle tick
//! (ghost timers, container lifetimes, port cooldown, queue drain), and the
//! chat-event router. Container start and health probing run as detached
//! tasks so the loop never blocks on I/O.
//!
//! ```text
//!   poll ──▶ admit ──▶ accept + join room ──▶ start ──▶ health ──▶ ready
//!                                   │ (no slot)                      │
//!                                   └──▶ queue ◀── drain ◀── retire ◀┘
//! ```

pub mod jobs;
mod router;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};

use crate::attest::{self, CreationRecord, DeletionRecord, ResourceLimits};
use crate::chat::{self, ChatEvent, ChatHandle};
use crate::config::Config;
use crate::container::{ContainerManager, StartedContainer};
use crate::error::{Error, IdentityError};
use crate::identity::{Identity, IdentityPool};
use crate::joblog::{CREATION_ATTESTATION_FILE, DELETION_ATTESTATION_FILE, JobStore};
use crate::limits::AcceptWindow;
use crate::market::{Job, JobStatus, MarketClient};
use crate::proxy::TokenRegistry;

use self::jobs::{ActiveJob, JobState, JobTable};

const LIFECYCLE_TICK: Duration = Duration::from_secs(5);
const PRIVACY_TIER: &str = "standard";
const DELETION_METHOD: &str = "docker-remove";

/// Why a job is being retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Ready container that never received a buyer message.
    Ghost,
    /// Container exceeded its maximum lifetime.
    Lifetime,
    /// Health probe never succeeded.
    HealthFailed,
    /// Too many consecutive sandbox request failures.
    SandboxFailures,
    /// Dispatcher is shutting down.
    Shutdown,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ghost => "ghost",
            Self::Lifetime => "timeout",
            Self::HealthFailed => "health_failed",
            Self::SandboxFailures => "sandbox_failures",
            Self::Shutdown => "shutdown",
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, Self::Lifetime)
    }

    /// Parting message to the buyer, where one makes sense.
    fn buyer_message(&self) -> Option<&'static str> {
        match self {
            Self::Lifetime => Some("Session time limit reached. Thanks for chatting!"),
            Self::HealthFailed | Self::SandboxFailures => Some(router::MSG_APOLOGY),
            Self::Ghost | Self::Shutdown => None,
        }
    }
}

/// Internal commands fed back into the run loop by worker tasks.
pub(crate) enum Command {
    Retire {
        job_id: String,
        reason: RetireReason,
    },
}

/// Shared dispatcher state. Everything long-lived hangs off one `Arc`.
pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) pool: IdentityPool,
    pub(crate) clients: HashMap<String, Arc<MarketClient>>,
    pub(crate) chat: ChatHandle,
    pub(crate) manager: Arc<ContainerManager>,
    pub(crate) store: JobStore,
    pub(crate) table: Mutex<JobTable>,
    pub(crate) accepts: Mutex<AcceptWindow>,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    /// Parallel-job cap: the smaller of identity count and port count.
    pub(crate) capacity: usize,
}

/// The dispatcher process.
pub struct Dispatcher {
    inner: Arc<Inner>,
    chat_rx: mpsc::Receiver<ChatEvent>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl Dispatcher {
    /// Assemble the dispatcher. Fatal on empty identity pool or client
    /// construction failure.
    pub fn new(config: Config, registry: TokenRegistry) -> Result<Self, Error> {
        let pool = IdentityPool::load(
            &config.market.agents_dir,
            config.market.keys_file.as_ref(),
        )?;
        tracing::info!(
            identities = pool.len(),
            ports = config.container.pool_size(),
            "Identity pool loaded"
        );

        let mut clients = HashMap::new();
        for identity in pool.identities() {
            let client = Arc::new(MarketClient::new(&config.market.api_base, identity.clone())?);
            clients.insert(identity.agent_id.clone(), client);
        }

        let store = JobStore::new(&config.dispatch.jobs_path);
        let manager = Arc::new(ContainerManager::new(
            config.container.clone(),
            config.proxy.port,
            config.dispatch.wiki_path.clone(),
            store.clone(),
            registry,
        ));

        // The chat transport authenticates with the first identity's
        // session; rooms for every identity's jobs ride the one socket.
        let primary = pool
            .identities()
            .first()
            .and_then(|i| clients.get(&i.agent_id))
            .cloned()
            .ok_or(Error::Identity(IdentityError::PoolEmpty))?;
        let (chat_handle, chat_rx) = chat::spawn(primary, &config.market.api_base);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let capacity = pool.len().min(config.container.pool_size());
        let accepts = Mutex::new(AcceptWindow::new(config.dispatch.max_accepts_per_minute));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                clients,
                chat: chat_handle,
                manager,
                store,
                table: Mutex::new(JobTable::new()),
                accepts,
                cmd_tx,
                capacity,
            }),
            chat_rx,
            cmd_rx,
        })
    }

    /// Run until `shutdown` resolves, then destroy every container and
    /// return.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        self.inner.reconcile().await;

        let mut poll = tokio::time::interval(self.inner.config.dispatch.poll_interval);
        let mut tick = tokio::time::interval(LIFECYCLE_TICK);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = poll.tick() => self.inner.poll_marketplace().await,
                _ = tick.tick() => self.inner.enforce().await,
                Some(event) = self.chat_rx.recv() => {
                    router::handle_event(&self.inner, event).await;
                }
                Some(command) = self.cmd_rx.recv() => match command {
                    Command::Retire { job_id, reason } => {
                        self.inner.retire(&job_id, reason).await;
                    }
                },
            }
        }

        tracing::info!("Shutdown requested, retiring all jobs");
        self.inner.shutdown_all().await;
        Ok(())
    }
}

impl Inner {
    pub(crate) const MAX_CONSECUTIVE_FAILURES: u32 = 3;

    fn client_for(&self, identity: &Identity) -> Option<Arc<MarketClient>> {
        self.clients.get(&identity.agent_id).cloned()
    }

    /// Startup reconciliation: authenticate every identity, rejoin rooms
    /// for jobs already ours, and mark them seen. Previous containers are
    /// assumed gone; a buyer turn will start a fresh sandbox on demand.
    async fn reconcile(self: &Arc<Self>) {
        for client in self.clients.values() {
            if let Err(e) = client.login().await {
                tracing::warn!(
                    identity = %client.identity().identity_name,
                    error = %e,
                    "Login failed during reconciliation"
                );
                continue;
            }

            for status in [JobStatus::Accepted, JobStatus::InProgress] {
                let jobs = match client.my_jobs(status).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to list active jobs");
                        continue;
                    }
                };
                for job in jobs {
                    let job_id = job.job_id.clone();
                    {
                        let mut table = self.table.lock().await;
                        if table.contains(&job_id) {
                            continue;
                        }
                        table.mark_seen(&job_id);
                    }

                    let _ = self.chat.join(&job_id).await;

                    let log = self.store.log(&job_id);
                    if log.exists() {
                        let _ = log.lifecycle(
                            "dispatcher:restarted",
                            "previous container lost; a new sandbox starts on demand",
                        );
                    }

                    tracing::info!(job_id, "Reconciled active job");
                    self.table
                        .lock()
                        .await
                        .insert(ActiveJob::new(job, client.identity().clone()));
                }
            }
        }
    }

    /// One admission poll across all identities.
    async fn poll_marketplace(self: &Arc<Self>) {
        for client in self.clients.values() {
            let jobs = match client.my_jobs(JobStatus::Requested).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(
                        identity = %client.identity().identity_name,
                        error = %e,
                        "Job poll failed"
                    );
                    continue;
                }
            };

            for job in jobs {
                let skip = {
                    let table = self.table.lock().await;
                    table.is_seen(&job.job_id) || table.contains(&job.job_id)
                };
                if skip {
                    continue;
                }
                self.admit(job, client).await;
            }
        }
    }

    /// Admission decision for one newly observed job.
    async fn admit(self: &Arc<Self>, job: Job, client: &Arc<MarketClient>) {
        // Rate cap first: a refused job stays `requested` on the
        // marketplace and is reconsidered next poll (not marked seen).
        if !self.accepts.lock().await.would_accept() {
            tracing::debug!(job_id = %job.job_id, "Accept rate cap reached, skipping");
            return;
        }

        // Never accept a job we could not even queue.
        let (has_slot, can_queue) = {
            let table = self.table.lock().await;
            (
                table.in_flight() < self.capacity,
                table.queued() < self.config.dispatch.max_queued_jobs,
            )
        };
        if !has_slot && !can_queue {
            tracing::debug!(job_id = %job.job_id, "Pool and queue full, leaving job unclaimed");
            return;
        }

        if let Err(e) = client.accept_job(&job).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Acceptance failed");
            return;
        }
        self.accepts.lock().await.record();
        self.table.lock().await.mark_seen(&job.job_id);

        if let Err(e) = self.store.init_job(&job) {
            tracing::warn!(job_id = %job.job_id, error = %e, "Failed to write job directory");
        }
        let _ = self.chat.join(&job.job_id).await;

        let job_id = job.job_id.clone();
        self.table
            .lock()
            .await
            .insert(ActiveJob::new(job, client.identity().clone()));

        if has_slot {
            self.spawn_start(&job_id).await;
        } else {
            let position = self.table.lock().await.enqueue(&job_id);
            let _ = self
                .chat
                .send(&job_id, &router::queued_notice(position))
                .await;
            tracing::info!(job_id, position, "Job queued");
        }
    }

    /// Mark a job `Starting` (holding its capacity slot) and launch the
    /// start flow as a detached task.
    async fn spawn_start(self: &Arc<Self>, job_id: &str) {
        {
            let mut table = self.table.lock().await;
            match table.get_mut(job_id) {
                Some(entry) => entry.state = JobState::Starting,
                None => return,
            }
        }
        let inner = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            inner.start_flow(&job_id).await;
        });
    }

    async fn start_flow(self: &Arc<Self>, job_id: &str) {
        let identity = match self.table.lock().await.get(job_id) {
            Some(entry) => entry.identity.clone(),
            None => return,
        };

        match self.manager.start(job_id, &identity).await {
            Ok(Some(started)) => {
                {
                    let mut table = self.table.lock().await;
                    if let Some(entry) = table.get_mut(job_id) {
                        entry.port = Some(started.port);
                        entry.container_id = Some(started.container_id.clone());
                    }
                }
                match self.manager.wait_for_health(started.port).await {
                    Ok(()) => self.on_ready(job_id, &identity, &started).await,
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "Sandbox never became healthy");
                        self.retire(job_id, RetireReason::HealthFailed).await;
                    }
                }
            }
            Ok(None) => {
                // Ports exhausted after all: back to the queue.
                let position = {
                    let mut table = self.table.lock().await;
                    if let Some(entry) = table.get_mut(job_id) {
                        entry.state = JobState::Queued;
                    }
                    table.enqueue(job_id)
                };
                let _ = self
                    .chat
                    .send(job_id, &router::queued_notice(position))
                    .await;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Container start failed, dropping admission");
                let _ = self
                    .store
                    .log(job_id)
                    .lifecycle("error", &format!("container start failed: {e}"));
                self.table.lock().await.remove(job_id);
                self.drain_queue().await;
            }
        }
    }

    /// Container passed its health probe: arm the ghost timer, spawn the
    /// turn worker, write and submit the creation attestation.
    async fn on_ready(self: &Arc<Self>, job_id: &str, identity: &Arc<Identity>, started: &StartedContainer) {
        let turn_tx = router::spawn_turn_worker(Arc::clone(self), job_id.to_string(), started.port);

        let job = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(job_id) else {
                return;
            };
            entry.state = JobState::Ready;
            entry.ready_at = Some(Instant::now());
            entry.turn_tx = Some(turn_tx);
            entry.job.clone()
        };

        let log = self.store.log(job_id);
        let _ = log.lifecycle(
            attest::TYPE_CREATED,
            &format!("port={} container={}", started.port, started.container_id),
        );

        let created_at = Utc::now();
        let job_hash = match attest::local_job_hash(
            &job.job_id,
            &job.description,
            &job.buyer_verus_id,
            &job.amount,
            &job.currency,
            created_at.timestamp(),
        ) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to compute local job hash");
                String::new()
            }
        };

        let record = CreationRecord {
            record_type: attest::TYPE_CREATED,
            job_id: job_id.to_string(),
            container_id: started.container_id.clone(),
            agent_id: identity.agent_id.clone(),
            identity: identity.identity_name.clone(),
            created_at,
            job_hash,
            resource_limits: ResourceLimits {
                memory_mb: self.config.container.memory_limit_mb,
                cpus: self.config.container.cpus,
            },
            privacy_tier: PRIVACY_TIER.to_string(),
        };

        match attest::sign_record(&record, identity) {
            Ok(signed) => {
                if let Err(e) =
                    self.store
                        .write_attestation(job_id, CREATION_ATTESTATION_FILE, &signed)
                {
                    tracing::warn!(job_id, error = %e, "Failed to persist creation attestation");
                }
                if let Some(client) = self.client_for(identity) {
                    if let Err(e) = client.submit_attestation(job_id, &signed).await {
                        tracing::warn!(job_id, error = %e, "Creation attestation submit failed (non-fatal)");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to sign creation attestation");
            }
        }

        tracing::info!(job_id, port = started.port, "Job ready");
    }

    /// Retire a job: notify the buyer, destroy the container (token revoke
    /// happens inside), write and submit the deletion attestation, deliver
    /// the transcript hash, release the table entry, drain the queue.
    pub(crate) async fn retire(self: &Arc<Self>, job_id: &str, reason: RetireReason) {
        let (port, identity) = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(job_id) else {
                return;
            };
            if entry.state == JobState::Retiring {
                return;
            }
            entry.state = JobState::Retiring;
            entry.turn_tx = None;
            (entry.port, entry.identity.clone())
        };

        tracing::info!(job_id, reason = reason.as_str(), "Retiring job");

        if let Some(message) = reason.buyer_message() {
            let _ = self.chat.send(job_id, message).await;
        }

        let log = self.store.log(job_id);
        let _ = log.lifecycle("retired", &format!("reason={}", reason.as_str()));

        let record = match port {
            Some(port) => match self.manager.destroy(port).await {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(job_id, port, error = %e, "Container destroy failed");
                    None
                }
            },
            None => None,
        };

        let transcript = log.transcript_hash().unwrap_or_default();

        if let Some(record) = record {
            let deletion = DeletionRecord {
                record_type: attest::TYPE_DESTROYED,
                job_id: job_id.to_string(),
                container_id: record.container_id.clone(),
                created_at: record.created_at,
                destroyed_at: Utc::now(),
                data_volumes: self.manager.data_volumes(),
                deletion_method: DELETION_METHOD.to_string(),
                transcript_sha256: transcript.clone(),
                reason: None,
            };
            let deletion = if reason.is_timeout() {
                deletion.timeout()
            } else {
                deletion
            };

            match attest::sign_record(&deletion, &identity) {
                Ok(signed) => {
                    if let Err(e) =
                        self.store
                            .write_attestation(job_id, DELETION_ATTESTATION_FILE, &signed)
                    {
                        tracing::warn!(job_id, error = %e, "Failed to persist deletion attestation");
                    }
                    if let Some(client) = self.client_for(&identity) {
                        if let Err(e) = client.submit_attestation(job_id, &signed).await {
                            tracing::warn!(job_id, error = %e, "Deletion attestation submit failed (non-fatal)");
                        }
                        if reason != RetireReason::Shutdown {
                            if let Err(e) = client.deliver(job_id, &transcript).await {
                                tracing::warn!(job_id, error = %e, "Delivery failed (non-fatal)");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Failed to sign deletion attestation");
                }
            }
        }

        self.table.lock().await.remove(job_id);
        if reason != RetireReason::Shutdown {
            self.drain_queue().await;
        }
    }

    /// Promote queued jobs while capacity is available.
    fn drain_queue<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move { self.drain_queue_inner().await })
    }

    async fn drain_queue_inner(self: &Arc<Self>) {
        loop {
            let next = {
                let mut table = self.table.lock().await;
                if table.in_flight() >= self.capacity {
                    None
                } else {
                    let next = table.dequeue();
                    // Hold the capacity slot before the lock drops so
                    // concurrent drains cannot over-promote.
                    if let Some(ref job_id) = next {
                        if let Some(entry) = table.get_mut(job_id) {
                            entry.state = JobState::Starting;
                        }
                    }
                    next
                }
            };

            let Some(job_id) = next else { break };
            tracing::info!(job_id, "Promoting queued job");
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.start_flow(&job_id).await;
            });
        }
    }

    /// Periodic lifecycle enforcement.
    async fn enforce(self: &Arc<Self>) {
        let ghosts = {
            self.table
                .lock()
                .await
                .ghosts(self.config.dispatch.ghost_timeout)
        };
        for job_id in ghosts {
            tracing::info!(job_id, "Ghost timeout expired");
            self.retire(&job_id, RetireReason::Ghost).await;
        }

        for (port, job_id) in self.manager.expired().await {
            tracing::info!(job_id, port, "Container exceeded max lifetime");
            self.retire(&job_id, RetireReason::Lifetime).await;
        }

        self.manager.sweep_cooldown().await;
        self.drain_queue().await;
    }

    /// An idle table entry (reconciled after a restart, or recovered on
    /// demand) got a buyer turn: start a sandbox now if a slot is free,
    /// else queue it with a positional notice.
    pub(crate) async fn promote_idle(self: &Arc<Self>, job_id: &str) {
        let has_slot = {
            let table = self.table.lock().await;
            if !table.contains(job_id) {
                return;
            }
            table.in_flight() < self.capacity
        };

        if has_slot {
            self.spawn_start(job_id).await;
            let _ = self.chat.send(job_id, router::MSG_STARTING).await;
        } else {
            let position = self.table.lock().await.enqueue(job_id);
            let _ = self
                .chat
                .send(job_id, &router::queued_notice(position))
                .await;
        }
    }

    /// Buyer turn for a job we have no table entry for (restart case):
    /// recover the job record and start a fresh sandbox on demand.
    pub(crate) async fn on_demand_start(self: &Arc<Self>, job_id: &str) {
        let Some(client) = self.clients.values().next().cloned() else {
            return;
        };

        let job = match client.job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "On-demand job lookup failed");
                let _ = self.chat.send(job_id, router::MSG_QUEUED).await;
                return;
            }
        };

        {
            let mut table = self.table.lock().await;
            if table.contains(job_id) {
                return;
            }
            table.mark_seen(job_id);
            table.insert(ActiveJob::new(job, client.identity().clone()));
        }
        self.promote_idle(job_id).await;
    }

    /// Destroy every container and write best-effort attestations.
    async fn shutdown_all(self: &Arc<Self>) {
        let job_ids = { self.table.lock().await.job_ids() };
        for job_id in job_ids {
            self.retire(&job_id, RetireReason::Shutdown).await;
        }
    }
}
