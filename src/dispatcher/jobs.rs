//! Active-job table, admission queue, and seen-set.
//!
//! All three live behind one mutex owned by the dispatcher; every critical
//! section is a plain field update. Capacity invariant: at all times
//! `in_flight() + queued() <= capacity + queue_cap`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::identity::Identity;
use crate::market::Job;

/// How many observed job ids the seen-set remembers.
const SEEN_CAP: usize = 1024;

/// Lifecycle state of an admitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Starting,
    Ready,
    Retiring,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Retiring => write!(f, "retiring"),
        }
    }
}

/// One buyer turn handed to a job's worker.
#[derive(Debug)]
pub struct BuyerTurn {
    pub sender: String,
    pub content: String,
}

/// Entry for an admitted job.
pub struct ActiveJob {
    pub job: Job,
    pub identity: Arc<Identity>,
    pub state: JobState,
    pub port: Option<u16>,
    pub container_id: Option<String>,
    pub admitted_at: Instant,
    /// Set when the container passes its health probe.
    pub ready_at: Option<Instant>,
    /// Set on every inbound buyer turn; a job that reached `ready` and
    /// never got one is a ghost.
    pub last_buyer_turn: Option<Instant>,
    /// Feed to the per-job turn worker (present while `Ready`).
    pub turn_tx: Option<mpsc::Sender<BuyerTurn>>,
    pub consecutive_failures: u32,
}

impl ActiveJob {
    pub fn new(job: Job, identity: Arc<Identity>) -> Self {
        Self {
            job,
            identity,
            state: JobState::Queued,
            port: None,
            container_id: None,
            admitted_at: Instant::now(),
            ready_at: None,
            last_buyer_turn: None,
            turn_tx: None,
            consecutive_failures: 0,
        }
    }
}

/// The dispatcher's shared job state.
#[derive(Default)]
pub struct JobTable {
    jobs: HashMap<String, ActiveJob>,
    queue: VecDeque<String>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Seen set --

    pub fn mark_seen(&mut self, job_id: &str) {
        if self.seen.insert(job_id.to_string()) {
            self.seen_order.push_back(job_id.to_string());
            while self.seen_order.len() > SEEN_CAP {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }

    pub fn is_seen(&self, job_id: &str) -> bool {
        self.seen.contains(job_id)
    }

    // -- Table --

    pub fn insert(&mut self, entry: ActiveJob) {
        self.jobs.insert(entry.job.job_id.clone(), entry);
    }

    pub fn get(&self, job_id: &str) -> Option<&ActiveJob> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut ActiveJob> {
        self.jobs.get_mut(job_id)
    }

    pub fn remove(&mut self, job_id: &str) -> Option<ActiveJob> {
        self.queue.retain(|id| id != job_id);
        self.jobs.remove(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Jobs holding or acquiring a container.
    pub fn in_flight(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Starting | JobState::Ready))
            .count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    /// Jobs in `Ready` whose ghost timer has expired: reached ready at
    /// least `ghost_timeout` ago and never received a buyer turn.
    pub fn ghosts(&self, ghost_timeout: std::time::Duration) -> Vec<String> {
        let now = Instant::now();
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Ready && j.last_buyer_turn.is_none())
            .filter(|j| {
                j.ready_at
                    .is_some_and(|at| now.duration_since(at) >= ghost_timeout)
            })
            .map(|j| j.job.job_id.clone())
            .collect()
    }

    // -- Queue --

    /// Enqueue a job; returns its 1-based position.
    pub fn enqueue(&mut self, job_id: &str) -> usize {
        if let Some(pos) = self.queue.iter().position(|id| id == job_id) {
            return pos + 1;
        }
        self.queue.push_back(job_id.to_string());
        self.queue.len()
    }

    pub fn dequeue(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// 1-based queue position, if the job is queued.
    pub fn queue_position(&self, job_id: &str) -> Option<usize> {
        self.queue.iter().position(|id| id == job_id).map(|p| p + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::test_identity;
    use crate::market::JobStatus;

    fn job(n: u32) -> Job {
        serde_json::from_value(serde_json::json!({
            "jobId": format!("job-{n}"),
            "status": "requested",
        }))
        .unwrap()
    }

    fn entry(n: u32) -> ActiveJob {
        ActiveJob::new(job(n), Arc::new(test_identity(1)))
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut table = JobTable::new();
        for i in 0..(SEEN_CAP + 10) {
            table.mark_seen(&format!("job-{i}"));
        }
        assert!(!table.is_seen("job-0"));
        assert!(table.is_seen(&format!("job-{}", SEEN_CAP + 9)));
    }

    #[test]
    fn queue_positions_are_one_based() {
        let mut table = JobTable::new();
        assert_eq!(table.enqueue("a"), 1);
        assert_eq!(table.enqueue("b"), 2);
        // Re-enqueueing returns the existing position.
        assert_eq!(table.enqueue("a"), 1);
        assert_eq!(table.queue_position("b"), Some(2));
        assert_eq!(table.dequeue().as_deref(), Some("a"));
        assert_eq!(table.queue_position("b"), Some(1));
    }

    #[test]
    fn remove_also_drops_queue_membership() {
        let mut table = JobTable::new();
        table.insert(entry(1));
        table.enqueue("job-1");
        assert_eq!(table.queued(), 1);

        table.remove("job-1");
        assert_eq!(table.queued(), 0);
        assert!(!table.contains("job-1"));
    }

    #[test]
    fn in_flight_counts_starting_and_ready() {
        let mut table = JobTable::new();
        for n in 1..=4 {
            table.insert(entry(n));
        }
        table.get_mut("job-1").unwrap().state = JobState::Starting;
        table.get_mut("job-2").unwrap().state = JobState::Ready;
        table.get_mut("job-3").unwrap().state = JobState::Retiring;
        assert_eq!(table.in_flight(), 2);
    }

    #[test]
    fn ghost_detection_requires_ready_and_silence() {
        let mut table = JobTable::new();
        table.insert(entry(1));
        table.insert(entry(2));
        table.insert(entry(3));

        let ready_at = Instant::now();
        {
            let j = table.get_mut("job-1").unwrap();
            j.state = JobState::Ready;
            j.ready_at = Some(ready_at);
        }
        {
            // Got a buyer turn: not a ghost.
            let j = table.get_mut("job-2").unwrap();
            j.state = JobState::Ready;
            j.ready_at = Some(ready_at);
            j.last_buyer_turn = Some(Instant::now());
        }
        {
            // Still queued: the ghost timer only arms at ready.
            let j = table.get_mut("job-3").unwrap();
            j.state = JobState::Queued;
        }

        std::thread::sleep(std::time::Duration::from_millis(20));
        let ghosts = table.ghosts(std::time::Duration::from_millis(10));
        assert_eq!(ghosts, vec!["job-1".to_string()]);

        // A longer timeout has not expired yet.
        assert!(table.ghosts(std::time::Duration::from_secs(300)).is_empty());
    }
}
