//! Exponential backoff schedule shared by discovery sources.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::BackoffConfig;

/// Thread-safe exponential backoff.
///
/// Starts at `initial_seconds`, multiplies on every [`increase`](Self::increase)
/// and saturates at `max_seconds`.
#[derive(Debug)]
pub struct Backoff {
    initial_seconds: u64,
    max_seconds: u64,
    multiplier: u64,
    current: AtomicU64,
}

impl Backoff {
    /// Construct a schedule at its initial value.
    #[must_use]
    pub fn new(initial_seconds: u64, max_seconds: u64, multiplier: u32) -> Self {
        Self {
            initial_seconds,
            max_seconds: max_seconds.max(initial_seconds),
            multiplier: u64::from(multiplier.max(1)),
            current: AtomicU64::new(initial_seconds),
        }
    }

    /// Current wait in seconds.
    #[must_use]
    pub fn seconds(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Grow the wait, capped at the maximum.
    pub fn increase(&self) {
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                let grown = now.max(1).saturating_mul(self.multiplier);
                Some(grown.min(self.max_seconds))
            });
    }

    /// Return to the initial wait.
    pub fn reset(&self) {
        self.current.store(self.initial_seconds, Ordering::SeqCst);
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(config.initial_seconds, config.max_seconds, config.multiplier)
    }
}
