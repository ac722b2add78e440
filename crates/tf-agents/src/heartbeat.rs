//! Heartbeat plumbing between a worker and its supervisor.

use std::time::Duration;

use tokio::time::Instant;

/// Handed to a worker; each [`beat`](HeartbeatSender::beat) proves liveness.
#[derive(Debug, Clone)]
pub struct HeartbeatSender {
    tx: flume::Sender<Instant>,
}

impl HeartbeatSender {
    /// Record a heartbeat. Never blocks; a heartbeat sent after the session
    /// ended is dropped.
    pub fn beat(&self) {
        let _ = self.tx.send(Instant::now());
    }
}

pub type HeartbeatReceiver = flume::Receiver<Instant>;

pub fn channel() -> (HeartbeatSender, HeartbeatReceiver) {
    let (tx, rx) = flume::unbounded();
    (HeartbeatSender { tx }, rx)
}

/// Detects a session whose heartbeats stopped.
///
/// A session is stale once `interval * missed` elapsed since the last
/// heartbeat, or since spawn when none arrived yet.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    interval: Duration,
    missed: u32,
    last: Instant,
    beats: u64,
}

impl HeartbeatTracker {
    pub fn new(interval: Duration, missed: u32) -> Self {
        Self {
            interval,
            missed: missed.max(1),
            last: Instant::now(),
            beats: 0,
        }
    }

    /// Record a heartbeat observed at `at`; out-of-order beats never move the
    /// baseline backwards.
    pub fn record(&mut self, at: Instant) {
        if at > self.last {
            self.last = at;
        }
        self.beats += 1;
    }

    pub fn threshold(&self) -> Duration {
        self.interval * self.missed
    }

    pub fn deadline(&self) -> Instant {
        self.last + self.threshold()
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Time since the last heartbeat (or spawn).
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stale_after_missed_intervals() {
        let mut tracker = HeartbeatTracker::new(Duration::from_secs(30), 2);
        assert!(!tracker.is_stale(Instant::now()));

        tokio::time::advance(Duration::from_secs(45)).await;
        tracker.record(Instant::now());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!tracker.is_stale(Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tracker.is_stale(Instant::now()));
        assert_eq!(tracker.beats(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn beats_flow_through_channel() {
        let (tx, rx) = channel();
        tx.beat();
        tx.beat();
        assert_eq!(rx.len(), 2);
        drop(rx);
        tx.beat();
    }
}
