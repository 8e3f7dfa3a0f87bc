//! # Server Error Tracker
//!
//! Purpose: Pace batch retries per destination server. A server that keeps
//! failing is given progressively longer pauses, and the whole batch gives up
//! once a fixed time budget is spent.
//!
//! ## Design Principles
//! 1. **Scoped State**: One tracker per batch; nothing outlives the call.
//! 2. **Credit for Waiting**: Time already spent since a server's last error is
//!    subtracted from its next pause.
//! 3. **Hard Deadline**: The deadline is fixed at creation and never extended.

use std::collections::HashMap;
use std::time::Duration;

use rkv_common::ServerName;
use tokio::time::Instant;

use crate::config::pause_time;

#[derive(Debug, Clone, Copy)]
struct ServerErrors {
    retries: u32,
    last_error: Instant,
}

/// Per-batch record of failures by destination server.
#[derive(Debug)]
pub struct ServerErrorTracker {
    errors: HashMap<ServerName, ServerErrors>,
    deadline: Instant,
}

impl ServerErrorTracker {
    /// Creates a tracker allowing retries for `budget` from now.
    pub fn new(budget: Duration) -> Self {
        ServerErrorTracker {
            errors: HashMap::new(),
            deadline: Instant::now() + budget,
        }
    }

    /// Returns false once the deadline is reached.
    pub fn can_retry_more(&self) -> bool {
        Instant::now() < self.deadline
    }

    /// Records a failure against `server`.
    ///
    /// The first failure opens a record at zero retries; each later one bumps it.
    pub fn report_error(&mut self, server: &ServerName) {
        let now = Instant::now();
        self.errors
            .entry(server.clone())
            .and_modify(|stats| {
                stats.retries += 1;
                stats.last_error = now;
            })
            .or_insert(ServerErrors {
                retries: 0,
                last_error: now,
            });
    }

    /// Pause to apply before sending to `server` again.
    ///
    /// **Logic**:
    /// 1. No recorded error: no pause.
    /// 2. Otherwise `pause_time(base, retries)` minus the time since the last error.
    /// 3. Clamp so the pause never runs past the deadline.
    pub fn backoff_for(&self, server: &ServerName, base: Duration) -> Duration {
        let stats = match self.errors.get(server) {
            Some(stats) => stats,
            None => return Duration::ZERO,
        };
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(stats.last_error);
        let pause = pause_time(base, stats.retries).saturating_sub(elapsed);
        if !pause.is_zero() && now + pause > self.deadline {
            return self.deadline.saturating_duration_since(now);
        }
        pause
    }

    /// Number of errors recorded for `server` beyond the first.
    pub fn retries_for(&self, server: &ServerName) -> Option<u32> {
        self.errors.get(server).map(|stats| stats.retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str) -> ServerName {
        ServerName::new(host, 16020, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_with_errors() {
        let base = Duration::from_millis(100);
        let mut tracker = ServerErrorTracker::new(Duration::from_secs(3600));
        let rs1 = server("rs1");

        assert_eq!(tracker.backoff_for(&rs1, base), Duration::ZERO);

        tracker.report_error(&rs1);
        assert_eq!(tracker.retries_for(&rs1), Some(0));
        assert_eq!(tracker.backoff_for(&rs1, base), Duration::from_millis(100));

        tracker.report_error(&rs1);
        tracker.report_error(&rs1);
        assert_eq!(tracker.backoff_for(&rs1, base), Duration::from_millis(300));

        // Other servers are unaffected.
        assert_eq!(tracker.backoff_for(&server("rs2"), base), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_is_credited() {
        let base = Duration::from_millis(100);
        let mut tracker = ServerErrorTracker::new(Duration::from_secs(3600));
        let rs1 = server("rs1");
        tracker.report_error(&rs1);

        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(tracker.backoff_for(&rs1, base), Duration::from_millis(60));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(tracker.backoff_for(&rs1, base), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_clamped_to_deadline() {
        let base = Duration::from_secs(10);
        let mut tracker = ServerErrorTracker::new(Duration::from_secs(4));
        let rs1 = server("rs1");
        tracker.report_error(&rs1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(tracker.backoff_for(&rs1, base), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn can_retry_more_flips_after_deadline() {
        let mut tracker = ServerErrorTracker::new(Duration::from_millis(500));
        for _ in 0..20 {
            tracker.report_error(&server("rs1"));
        }
        assert!(tracker.can_retry_more());

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(tracker.can_retry_more());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!tracker.can_retry_more());
    }
}
