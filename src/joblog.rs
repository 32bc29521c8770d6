//! Per-job on-disk state: the job directory and the append-only
//! dispatcher log.
//!
//! Layout under `${JOBS_PATH}/<job_id>/`:
//!
//! ```text
//! description.txt              buyer-visible job description
//! buyer.txt                    buyer identity
//! amount.txt / currency.txt    agreed price
//! dispatcher-log.jsonl         every turn and lifecycle event
//! creation-attestation.json    signed creation record
//! deletion-attestation.json    signed deletion record
//! sandbox/                     generated container config tree (wiped on destroy)
//! ```
//!
//! The SHA-256 over the raw bytes of `dispatcher-log.jsonl` is the
//! authoritative transcript hash recorded into the deletion attestation.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobLogError;
use crate::market::Job;
use crate::signing::sha256_hex;

pub const LOG_FILE: &str = "dispatcher-log.jsonl";
pub const CREATION_ATTESTATION_FILE: &str = "creation-attestation.json";
pub const DELETION_ATTESTATION_FILE: &str = "deletion-attestation.json";
pub const SANDBOX_DIR: &str = "sandbox";

/// Role of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRole {
    User,
    Assistant,
    System,
}

/// One JSONL record. Extra metadata is flattened into the object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub role: LogRole,
    pub content: String,
    #[serde(flatten)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl LogEntry {
    pub fn new(role: LogRole, content: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            role,
            content: content.into(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

/// Root of the per-job directory tree.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn sandbox_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(SANDBOX_DIR)
    }

    /// Create the job directory and write the observed job attributes.
    pub fn init_job(&self, job: &Job) -> Result<(), JobLogError> {
        let dir = self.job_dir(&job.job_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("description.txt"), &job.description)?;
        std::fs::write(dir.join("buyer.txt"), &job.buyer_verus_id)?;
        std::fs::write(dir.join("amount.txt"), &job.amount)?;
        std::fs::write(dir.join("currency.txt"), &job.currency)?;
        Ok(())
    }

    pub fn log(&self, job_id: &str) -> JobLog {
        JobLog {
            path: self.job_dir(job_id).join(LOG_FILE),
        }
    }

    /// Persist a signed attestation document into the job directory.
    pub fn write_attestation(
        &self,
        job_id: &str,
        file_name: &str,
        attestation: &serde_json::Value,
    ) -> Result<(), JobLogError> {
        let dir = self.job_dir(job_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join(file_name),
            serde_json::to_vec_pretty(attestation)?,
        )?;
        Ok(())
    }

    /// Remove the generated sandbox config tree (called on destroy).
    pub fn wipe_sandbox(&self, job_id: &str) -> Result<(), JobLogError> {
        let dir = self.sandbox_dir(job_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Append-only JSONL log for one job.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
}

impl JobLog {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Append one record. Creates the file (and parent directory) on first
    /// write.
    pub fn append(&self, entry: &LogEntry) -> Result<(), JobLogError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Log a buyer turn with its per-turn nonce.
    pub fn user_turn(&self, sender: &str, nonce: &str, content: &str) -> Result<(), JobLogError> {
        self.append(
            &LogEntry::new(LogRole::User, content)
                .with("sender", sender)
                .with("nonce", nonce),
        )
    }

    /// Log the assistant reply for a turn.
    pub fn assistant_turn(
        &self,
        nonce: &str,
        port: u16,
        model: &str,
        content: &str,
    ) -> Result<(), JobLogError> {
        self.append(
            &LogEntry::new(LogRole::Assistant, content)
                .with("nonce", nonce)
                .with("port", port)
                .with("model", model),
        )
    }

    /// Log a lifecycle event (`container:created`, `error`, `retired`, …).
    pub fn lifecycle(&self, event: &str, detail: &str) -> Result<(), JobLogError> {
        self.append(&LogEntry::new(LogRole::System, detail).with("event", event))
    }

    /// SHA-256 over the file bytes, hex-encoded. An absent log hashes as
    /// empty input so the deletion attestation is always complete.
    pub fn transcript_hash(&self) -> Result<String, JobLogError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(sha256_hex(&bytes))
    }

    /// Read back all entries (tests and reconciliation checks).
    pub fn read_all(&self) -> Result<Vec<LogEntry>, JobLogError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::JobStatus;

    fn sample_job() -> Job {
        serde_json::from_value(serde_json::json!({
            "jobId": "job-log-test",
            "jobHash": "cafe",
            "buyerVerusId": "buyer@",
            "amount": "3.5",
            "currency": "VRSC",
            "description": "answer questions",
            "status": "requested",
        }))
        .unwrap()
    }

    #[test]
    fn init_job_writes_attribute_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let job = sample_job();
        store.init_job(&job).unwrap();

        let job_dir = store.job_dir(&job.job_id);
        assert_eq!(
            std::fs::read_to_string(job_dir.join("description.txt")).unwrap(),
            "answer questions"
        );
        assert_eq!(
            std::fs::read_to_string(job_dir.join("buyer.txt")).unwrap(),
            "buyer@"
        );
        assert_eq!(
            std::fs::read_to_string(job_dir.join("amount.txt")).unwrap(),
            "3.5"
        );
        assert_eq!(
            std::fs::read_to_string(job_dir.join("currency.txt")).unwrap(),
            "VRSC"
        );
        assert_eq!(job.status, JobStatus::Requested);
    }

    #[test]
    fn log_appends_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let log = store.log("job-1");

        log.user_turn("buyer@", "aabbccdd00112233", "hello").unwrap();
        log.assistant_turn("aabbccdd00112233", 42001, "default", "hi there")
            .unwrap();
        log.lifecycle("retired", "reason=ghost").unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].role, LogRole::User);
        assert_eq!(entries[0].meta["nonce"], "aabbccdd00112233");
        assert_eq!(entries[1].meta["port"], 42001);
        assert_eq!(entries[2].role, LogRole::System);
        assert_eq!(entries[2].meta["event"], "retired");
    }

    #[test]
    fn timestamps_are_monotonic_across_turns() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::at(dir.path().join(LOG_FILE));
        for i in 0..5 {
            log.append(&LogEntry::new(LogRole::User, format!("turn {i}")))
                .unwrap();
        }
        let entries = log.read_all().unwrap();
        for pair in entries.windows(2) {
            assert!(pair[0].ts <= pair[1].ts);
        }
    }

    #[test]
    fn transcript_hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::at(dir.path().join(LOG_FILE));

        let empty = log.transcript_hash().unwrap();
        log.lifecycle("container:created", "port=42000").unwrap();
        let one = log.transcript_hash().unwrap();
        assert_ne!(empty, one);

        // Hash is over raw bytes: identical files hash identically.
        let again = log.transcript_hash().unwrap();
        assert_eq!(one, again);
    }

    #[test]
    fn wipe_sandbox_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let sandbox = store.sandbox_dir("job-2");
        std::fs::create_dir_all(&sandbox).unwrap();
        std::fs::write(sandbox.join("client.json"), "{}").unwrap();

        store.wipe_sandbox("job-2").unwrap();
        assert!(!sandbox.exists());
        store.wipe_sandbox("job-2").unwrap();
    }
}
