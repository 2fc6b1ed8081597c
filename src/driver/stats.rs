use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Driver-wide counters. Updated lock-free from every multiplexer loop.
#[derive(Debug, Default)]
pub struct Statistics {
    jobs_admitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_cancelled: AtomicU64,
    units_dispatched: AtomicU64,
    units_completed: AtomicU64,
    units_requeued: AtomicU64,
    executors: AtomicU64,
    executed_units: AtomicU64,
    execution_ms: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub jobs_admitted: u64,
    pub jobs_completed: u64,
    pub jobs_cancelled: u64,
    pub jobs_queued: usize,
    pub units_dispatched: u64,
    pub units_completed: u64,
    pub units_requeued: u64,
    pub executors: u64,
    pub mean_unit_ms: f64,
}

impl Statistics {
    pub fn job_admitted(&self) {
        self.jobs_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self, cancelled: bool) {
        if cancelled {
            self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn units_dispatched(&self, count: usize) {
        self.units_dispatched
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record results accepted by the queue along with their summed execution time.
    pub fn units_completed(&self, count: usize, elapsed_ms: u64) {
        self.units_completed
            .fetch_add(count as u64, Ordering::Relaxed);
        self.executed_units
            .fetch_add(count as u64, Ordering::Relaxed);
        self.execution_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn units_requeued(&self, count: usize) {
        self.units_requeued
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn executor_connected(&self) {
        self.executors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executor_disconnected(&self) {
        let _ = self
            .executors
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self, jobs_queued: usize) -> StatsSnapshot {
        let executed = self.executed_units.load(Ordering::Relaxed);
        let mean_unit_ms = if executed == 0 {
            0.0
        } else {
            self.execution_ms.load(Ordering::Relaxed) as f64 / executed as f64
        };
        StatsSnapshot {
            jobs_admitted: self.jobs_admitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_queued,
            units_dispatched: self.units_dispatched.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
            units_requeued: self.units_requeued.load(Ordering::Relaxed),
            executors: self.executors.load(Ordering::Relaxed),
            mean_unit_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_unit_time() {
        let stats = Statistics::default();
        assert_eq!(stats.snapshot(0).mean_unit_ms, 0.0);
        stats.units_completed(4, 200);
        assert_eq!(stats.snapshot(0).mean_unit_ms, 50.0);
    }

    #[test]
    fn executor_gauge_never_underflows() {
        let stats = Statistics::default();
        stats.executor_disconnected();
        stats.executor_connected();
        stats.executor_connected();
        stats.executor_disconnected();
        assert_eq!(stats.snapshot(0).executors, 1);
    }

    #[test]
    fn job_outcomes_counted_separately() {
        let stats = Statistics::default();
        stats.job_admitted();
        stats.job_admitted();
        stats.job_finished(false);
        stats.job_finished(true);
        let snap = stats.snapshot(0);
        assert_eq!(snap.jobs_admitted, 2);
        assert_eq!(snap.jobs_completed, 1);
        assert_eq!(snap.jobs_cancelled, 1);
    }
}
