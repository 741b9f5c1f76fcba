//! Global atomic counters for servcur.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the daemon does so on shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

use servcur_state::JobState;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    jobs_dispatched: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    log_bytes_appended: AtomicU64,
    log_chunks_evicted: AtomicU64,
    runtime_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_dispatched: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            log_bytes_appended: AtomicU64::new(0),
            log_chunks_evicted: AtomicU64::new(0),
            runtime_retries: AtomicU64::new(0),
        }
    }

    pub fn inc_jobs_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a job that reached `state`. Non-terminal states are ignored.
    pub fn record_finished(&self, state: JobState) {
        let counter = match state {
            JobState::Succeeded => &self.jobs_succeeded,
            JobState::Failed => &self.jobs_failed,
            JobState::Cancelled => &self.jobs_cancelled,
            JobState::Pending | JobState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_log_bytes(&self, n: u64) {
        self.log_bytes_appended.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_chunks_evicted(&self, n: u64) {
        self.log_chunks_evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_runtime_retries(&self) {
        self.runtime_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runtime_retries", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            jobs_dispatched = self.jobs_dispatched(),
            jobs_succeeded = self.jobs_succeeded(),
            jobs_failed = self.jobs_failed(),
            jobs_cancelled = self.jobs_cancelled(),
            log_bytes_appended = self.log_bytes_appended(),
            log_chunks_evicted = self.log_chunks_evicted(),
            runtime_retries = self.runtime_retries(),
        );
    }

    pub fn jobs_dispatched(&self) -> u64 {
        self.jobs_dispatched.load(Ordering::Relaxed)
    }

    pub fn jobs_succeeded(&self) -> u64 {
        self.jobs_succeeded.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_cancelled(&self) -> u64 {
        self.jobs_cancelled.load(Ordering::Relaxed)
    }

    pub fn log_bytes_appended(&self) -> u64 {
        self.log_bytes_appended.load(Ordering::Relaxed)
    }

    pub fn log_chunks_evicted(&self) -> u64 {
        self.log_chunks_evicted.load(Ordering::Relaxed)
    }

    pub fn runtime_retries(&self) -> u64 {
        self.runtime_retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.jobs_dispatched,
            &self.jobs_succeeded,
            &self.jobs_failed,
            &self.jobs_cancelled,
            &self.log_bytes_appended,
            &self.log_chunks_evicted,
            &self.runtime_retries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_jobs_are_counted_by_state() {
        let m = Metrics::new();
        m.inc_jobs_dispatched();
        m.inc_jobs_dispatched();
        m.record_finished(JobState::Succeeded);
        m.record_finished(JobState::Cancelled);
        m.record_finished(JobState::Running);
        assert_eq!(m.jobs_dispatched(), 2);
        assert_eq!(m.jobs_succeeded(), 1);
        assert_eq!(m.jobs_failed(), 0);
        assert_eq!(m.jobs_cancelled(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.add_log_bytes(18);
        m.add_chunks_evicted(2);
        m.inc_runtime_retries();
        m.reset();
        assert_eq!(m.log_bytes_appended(), 0);
        assert_eq!(m.log_chunks_evicted(), 0);
        assert_eq!(m.runtime_retries(), 0);
    }
}
