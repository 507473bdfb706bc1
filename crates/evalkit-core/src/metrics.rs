//! Per-run counters. One [`RunMetrics`] is created by the runner and shared by `Arc`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RunMetrics {
    tasks_started: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    inference_calls: AtomicU64,
    judge_calls: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub inference_calls: u64,
    pub judge_calls: u64,
    pub retries: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_started(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one call; attempts after the first also count as retries.
    pub fn inference_call(&self, attempt: u32) {
        self.inference_calls.fetch_add(1, Ordering::Relaxed);
        if attempt > 0 {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn judge_call(&self) {
        self.judge_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            inference_calls: self.inference_calls.load(Ordering::Relaxed),
            judge_calls: self.judge_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_count_only_repeat_attempts() {
        let m = RunMetrics::new();
        m.inference_call(0);
        m.inference_call(1);
        m.inference_call(2);
        m.task_started();
        let s = m.snapshot();
        assert_eq!(s.inference_calls, 3);
        assert_eq!(s.retries, 2);
        assert_eq!(s.tasks_started, 1);
        assert_eq!(s.tasks_failed, 0);
    }
}
