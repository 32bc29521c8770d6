//! Admission and proxy rate limiting.
//!
//! Two sliding-window shapes:
//! - [`AcceptWindow`] tracks individual acceptance timestamps so the
//!   accepts-per-minute cap holds over any 60-second span.
//! - [`RateWindow`] is the cheaper fixed-start window used per proxy token,
//!   reset when the window expires.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding window over job-acceptance timestamps.
#[derive(Debug)]
pub struct AcceptWindow {
    cap: u32,
    stamps: VecDeque<Instant>,
}

impl AcceptWindow {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) >= WINDOW {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether another acceptance is currently allowed.
    pub fn would_accept(&mut self) -> bool {
        self.prune(Instant::now());
        (self.stamps.len() as u32) < self.cap
    }

    /// Record an acceptance that was just sent.
    pub fn record(&mut self) {
        self.stamps.push_back(Instant::now());
    }

    /// Check and record in one step; returns false when the cap is hit.
    pub fn try_accept(&mut self) -> bool {
        let now = Instant::now();
        self.prune(now);
        if (self.stamps.len() as u32) >= self.cap {
            return false;
        }
        self.stamps.push_back(now);
        true
    }

    pub fn used(&mut self) -> u32 {
        self.prune(Instant::now());
        self.stamps.len() as u32
    }
}

/// Fixed-start rate window (per proxy token).
#[derive(Debug, Clone)]
pub struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateWindow {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn maybe_reset(&mut self) {
        if self.window_start.elapsed() >= WINDOW {
            self.window_start = Instant::now();
            self.count = 0;
        }
    }

    /// Check the cap and record the request if allowed.
    pub fn check_and_record(&mut self, cap: u32) -> bool {
        self.maybe_reset();
        if self.count >= cap {
            return false;
        }
        self.count += 1;
        true
    }

    /// Time until the current window resets.
    pub fn retry_after(&self) -> Duration {
        WINDOW.saturating_sub(self.window_start.elapsed())
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}
