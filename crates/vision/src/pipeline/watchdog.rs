//! Heartbeats used by health checks to spot stalled loops.
//!
//! Loops call [`Heartbeat::beat`] after each productive iteration. A fresh
//! heartbeat starts in the future by a grace period so components get time to
//! warm up before they can be reported stale.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Grace period at startup allowing components to warm up before monitoring.
pub const STARTUP_GRACE: Duration = Duration::from_secs(5);
/// Time without a heartbeat before a loop is considered stalled.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct Heartbeat {
    label: &'static str,
    last_beat_ms: AtomicU64,
    beats: AtomicU64,
}

impl Heartbeat {
    pub fn new(label: &'static str) -> Self {
        Self::with_grace(label, STARTUP_GRACE)
    }

    pub fn with_grace(label: &'static str, grace: Duration) -> Self {
        let deadline = current_millis().saturating_add(grace.as_millis() as u64);
        Self {
            label,
            last_beat_ms: AtomicU64::new(deadline),
            beats: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn beat(&self) {
        self.last_beat_ms.store(current_millis(), Ordering::Relaxed);
        self.beats.fetch_add(1, Ordering::Relaxed);
    }

    /// Restart the grace period, used when the owning loop restarts.
    pub fn rearm(&self, grace: Duration) {
        let deadline = current_millis().saturating_add(grace.as_millis() as u64);
        self.last_beat_ms.store(deadline, Ordering::Relaxed);
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// Time since the last beat; zero while still inside the grace period.
    pub fn age(&self) -> Duration {
        let age = current_millis().saturating_sub(self.last_beat_ms.load(Ordering::Relaxed));
        Duration::from_millis(age)
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() > threshold
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_period_hides_missing_beats() {
        let heartbeat = Heartbeat::new("capture");
        assert!(!heartbeat.is_stale(Duration::ZERO));
        assert_eq!(heartbeat.age(), Duration::ZERO);
    }

    #[test]
    fn stale_without_beats_after_grace() {
        let heartbeat = Heartbeat::with_grace("pipeline", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(30));
        assert!(heartbeat.is_stale(Duration::from_millis(10)));

        heartbeat.beat();
        assert!(!heartbeat.is_stale(Duration::from_millis(500)));
        assert_eq!(heartbeat.beats(), 1);

        heartbeat.rearm(Duration::from_secs(60));
        assert!(!heartbeat.is_stale(Duration::ZERO));
    }
}
