//! Task executor metrics.

use metrics::Counter;

/// Counters for bounded token-manufacture task execution.
#[derive(Clone, Debug)]
pub struct TaskExecutorMetrics {
    /// Number of jobs admitted past the concurrency gate.
    pub(crate) jobs_spawned_total: Counter,
    /// Number of jobs that returned, successfully or not.
    pub(crate) jobs_finished_total: Counter,
    /// Number of jobs whose future panicked.
    pub(crate) jobs_panicked_total: Counter,
}

impl Default for TaskExecutorMetrics {
    fn default() -> Self {
        Self {
            jobs_spawned_total: metrics::counter!("tasks.executor.jobs_spawned_total"),
            jobs_finished_total: metrics::counter!("tasks.executor.jobs_finished_total"),
            jobs_panicked_total: metrics::counter!("tasks.executor.jobs_panicked_total"),
        }
    }
}

impl TaskExecutorMetrics {
    /// Increments the counter for admitted jobs.
    pub(crate) fn inc_spawned(&self) {
        self.jobs_spawned_total.increment(1);
    }

    /// Increments the counter for finished jobs.
    pub(crate) fn inc_finished(&self) {
        self.jobs_finished_total.increment(1);
    }

    /// Increments the counter for panicked jobs.
    pub(crate) fn inc_panicked(&self) {
        self.jobs_panicked_total.increment(1);
    }
}
