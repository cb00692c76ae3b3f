//! Heartbeat-based peer liveness.
//!
//! Any inbound frame counts as proof of life. A ping is only sent when the
//! peer has been quiet for most of a heartbeat interval; the peer is declared
//! dead after a run of consecutive pings that drew no traffic at all.

use crate::config::RpcConfig;
use crate::writer::Outbound;
use engine_protocol::Notification;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Records when the peer was last heard from.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    last_seen: Arc<Mutex<Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_seen: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Marks inbound traffic.
    pub fn observe(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Time since the peer was last heard from.
    pub fn idle(&self) -> Duration {
        self.last_seen().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    /// The peer missed `missed` heartbeats in a row.
    Dead { missed: u32 },
    /// The connection's writer is gone, so no ping can be sent.
    WriterClosed,
}

/// Periodic prober for one connection.
#[derive(Debug)]
pub struct LivenessMonitor {
    tracker: ActivityTracker,
    interval: Duration,
    pong_timeout: Duration,
    threshold: u32,
}

impl LivenessMonitor {
    pub fn new(config: &RpcConfig, tracker: ActivityTracker) -> Self {
        Self {
            tracker,
            interval: config.heartbeat_interval,
            pong_timeout: config.pong_timeout,
            threshold: config.missed_heartbeats.max(1),
        }
    }

    /// Runs until the peer is declared dead or the writer closes.
    ///
    /// Deadlines are counted from the last inbound frame: miss `k` is due at
    /// `last_seen + k * interval`, with its ping sent `pong_timeout` earlier.
    /// A silent peer is therefore declared dead exactly
    /// `threshold * interval` after it was last heard from.
    pub async fn run(self, outbound: Outbound) -> LivenessOutcome {
        let mut anchor = self.tracker.last_seen();
        let mut missed = 0u32;
        let mut seq = 0u64;

        loop {
            let deadline = anchor + self.interval.saturating_mul(missed + 1);
            let ping_at = deadline
                .checked_sub(self.pong_timeout)
                .unwrap_or(deadline)
                .max(anchor);
            tokio::time::sleep_until(ping_at).await;

            let seen = self.tracker.last_seen();
            if seen > anchor {
                anchor = seen;
                missed = 0;
                continue;
            }

            seq += 1;
            if outbound.send(&Notification::ping(seq).into()).await.is_err() {
                return LivenessOutcome::WriterClosed;
            }
            tokio::time::sleep_until(deadline).await;

            let seen = self.tracker.last_seen();
            if seen > anchor {
                anchor = seen;
                missed = 0;
                continue;
            }

            missed += 1;
            tracing::warn!(
                "No traffic for {:?} after ping seq={} ({}/{} missed)",
                self.tracker.idle(),
                seq,
                missed,
                self.threshold
            );
            if missed >= self.threshold {
                return LivenessOutcome::Dead { missed };
            }
        }
    }
}
