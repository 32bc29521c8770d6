//! Host port pool for sandbox containers.
//!
//! Every port in the configured range is in exactly one of three sets:
//! `free`, `in_use`, or `cooldown`. A released port sits in cooldown for a
//! configured period before becoming selectable again, so a lingering
//! client of a just-retired sandbox can never reach the next job's
//! container on the same port.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Lease metadata for an in-use port.
#[derive(Debug, Clone)]
pub struct PortLease {
    pub job_id: String,
    pub leased_at: Instant,
}

/// Fixed-range port pool.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    cooldown_period: Duration,
    free: BTreeSet<u16>,
    in_use: BTreeMap<u16, PortLease>,
    cooldown: HashMap<u16, Instant>,
}

impl PortPool {
    pub fn new(start: u16, end: u16, cooldown_period: Duration) -> Self {
        Self {
            start,
            end,
            cooldown_period,
            free: (start..=end).collect(),
            in_use: BTreeMap::new(),
            cooldown: HashMap::new(),
        }
    }

    /// Move cooled-down ports back to `free`.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .cooldown
            .iter()
            .filter(|(_, released)| now.duration_since(**released) >= self.cooldown_period)
            .map(|(port, _)| *port)
            .collect();
        for port in expired {
            self.cooldown.remove(&port);
            self.free.insert(port);
        }
    }

    /// Take the lowest free port. Sweeps cooldown first so a port becomes
    /// selectable at the first allocation after its cooldown elapses.
    pub fn allocate(&mut self, job_id: &str) -> Option<u16> {
        self.sweep();
        let port = *self.free.iter().next()?;
        self.free.remove(&port);
        self.in_use.insert(
            port,
            PortLease {
                job_id: job_id.to_string(),
                leased_at: Instant::now(),
            },
        );
        Some(port)
    }

    /// Release an in-use port into cooldown. Returns the lease, or `None`
    /// if the port was not in use.
    pub fn release(&mut self, port: u16) -> Option<PortLease> {
        let lease = self.in_use.remove(&port)?;
        self.cooldown.insert(port, Instant::now());
        Some(lease)
    }

    pub fn lease(&self, port: u16) -> Option<&PortLease> {
        self.in_use.get(&port)
    }

    /// Ports whose lease is older than `max_lifetime`, with their jobs.
    pub fn expired(&self, max_lifetime: Duration) -> Vec<(u16, String)> {
        let now = Instant::now();
        self.in_use
            .iter()
            .filter(|(_, lease)| now.duration_since(lease.leased_at) >= max_lifetime)
            .map(|(port, lease)| (*port, lease.job_id.clone()))
            .collect()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_len(&self) -> usize {
        self.in_use.len()
    }

    pub fn cooldown_len(&self) -> usize {
        self.cooldown.len()
    }

    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Check the partition invariant: the three sets are disjoint and
    /// cover the range exactly.
    pub fn check_partition(&self) -> bool {
        let mut seen = BTreeSet::new();
        for port in self.free.iter().copied() {
            if !seen.insert(port) {
                return false;
            }
        }
        for port in self.in_use.keys().copied() {
            if !seen.insert(port) {
                return false;
            }
        }
        for port in self.cooldown.keys().copied() {
            if !seen.insert(port) {
                return false;
            }
        }
        seen == (self.start..=self.end).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_first() {
        let mut pool = PortPool::new(42000, 42003, Duration::from_millis(50));
        assert_eq!(pool.allocate("a"), Some(42000));
        assert_eq!(pool.allocate("b"), Some(42001));
        assert!(pool.check_partition());
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = PortPool::new(42000, 42001, Duration::from_millis(50));
        assert!(pool.allocate("a").is_some());
        assert!(pool.allocate("b").is_some());
        assert!(pool.allocate("c").is_none());
        assert!(pool.check_partition());
    }

    #[test]
    fn released_port_not_reusable_during_cooldown() {
        let mut pool = PortPool::new(42000, 42000, Duration::from_secs(60));
        assert_eq!(pool.allocate("a"), Some(42000));
        let lease = pool.release(42000).unwrap();
        assert_eq!(lease.job_id, "a");

        // Single-port pool: the only port is cooling down.
        assert!(pool.allocate("b").is_none());
        assert_eq!(pool.cooldown_len(), 1);
        assert!(pool.check_partition());
    }

    #[test]
    fn cooldown_expiry_returns_port_to_free() {
        let mut pool = PortPool::new(42000, 42000, Duration::from_millis(20));
        pool.allocate("a");
        pool.release(42000);
        assert!(pool.allocate("b").is_none());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pool.allocate("b"), Some(42000));
        assert!(pool.check_partition());
    }

    #[test]
    fn release_of_unknown_port_is_none() {
        let mut pool = PortPool::new(42000, 42001, Duration::from_millis(50));
        assert!(pool.release(42000).is_none());
        assert!(pool.release(50000).is_none());
        assert!(pool.check_partition());
    }

    #[test]
    fn expired_lists_only_old_leases() {
        let mut pool = PortPool::new(42000, 42001, Duration::from_millis(50));
        pool.allocate("old");
        std::thread::sleep(Duration::from_millis(25));
        pool.allocate("young");

        let expired = pool.expired(Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0], (42000, "old".to_string()));
    }

    #[test]
    fn partition_holds_through_churn() {
        let mut pool = PortPool::new(42000, 42004, Duration::from_millis(5));
        for round in 0..10 {
            let job = format!("job-{round}");
            if let Some(port) = pool.allocate(&job) {
                if round % 2 == 0 {
                    pool.release(port);
                }
            }
            pool.sweep();
            assert!(pool.check_partition(), "partition broken at round {round}");
        }
    }
}
