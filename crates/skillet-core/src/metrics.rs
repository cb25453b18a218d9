//! Process-wide counters for evaluation work.
//!
//! Counters are bumped at the call site and reported together by
//! [`Metrics::flush`] at the end of a command.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    samples_graded: AtomicU64,
    cache_hits: AtomicU64,
    model_retries: AtomicU64,
    trials_run: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub samples_graded: u64,
    pub cache_hits: u64,
    pub model_retries: u64,
    pub trials_run: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            samples_graded: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            model_retries: AtomicU64::new(0),
            trials_run: AtomicU64::new(0),
        }
    }

    /// A sample reached a terminal state, fresh or cached.
    pub fn inc_samples_graded(&self) {
        self.samples_graded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "samples_graded", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_model_retries(&self) {
        self.model_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "model_retries", "counter incremented");
    }

    pub fn inc_trials(&self) {
        self.trials_run.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "trials_run", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_graded: self.samples_graded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            model_retries: self.model_retries.load(Ordering::Relaxed),
            trials_run: self.trials_run.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            samples_graded = s.samples_graded,
            cache_hits = s.cache_hits,
            model_retries = s.model_retries,
            trials_run = s.trials_run,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.samples_graded.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.model_retries.store(0, Ordering::Relaxed);
        self.trials_run.store(0, Ordering::Relaxed);
    }
}
