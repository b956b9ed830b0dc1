use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::metrics::now_unix_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentJob {
    pub task_id: Option<String>,
    pub video_url: String,
    pub started_ms: u64,
}

/// Observability counters for one worker. Never consulted for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub worker_id: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Subset of `failures` classified as source blocks.
    pub blocks: u64,
    pub last_used_ms: Option<u64>,
    pub last_error: Option<String>,
    pub current_job: Option<CurrentJob>,
}

impl WorkerStats {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            attempts: 0,
            successes: 0,
            failures: 0,
            blocks: 0,
            last_used_ms: None,
            last_error: None,
            current_job: None,
        }
    }
}

/// `attempts` is only bumped together with an outcome, so
/// `attempts == successes + failures` holds even while a job is in flight.
pub struct WorkerStatsStore {
    order: Vec<String>,
    inner: Mutex<HashMap<String, WorkerStats>>,
}

impl WorkerStatsStore {
    pub fn new(worker_ids: impl IntoIterator<Item = String>) -> Self {
        let order: Vec<String> = worker_ids.into_iter().collect();
        let inner = order
            .iter()
            .map(|id| (id.clone(), WorkerStats::new(id)))
            .collect();
        Self {
            order,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WorkerStats>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("worker stats lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    fn with_entry<R>(&self, worker_id: &str, f: impl FnOnce(&mut WorkerStats) -> R) -> R {
        let mut guard = self.lock();
        let entry = guard
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerStats::new(worker_id));
        f(entry)
    }

    pub fn begin(&self, worker_id: &str, job: CurrentJob) {
        self.with_entry(worker_id, |s| {
            s.last_used_ms = Some(job.started_ms);
            s.current_job = Some(job);
        });
    }

    pub fn record_success(&self, worker_id: &str) {
        self.with_entry(worker_id, |s| {
            s.attempts += 1;
            s.successes += 1;
            s.current_job = None;
        });
    }

    pub fn record_failure(&self, worker_id: &str, error: &str, blocked: bool) {
        self.with_entry(worker_id, |s| {
            s.attempts += 1;
            s.failures += 1;
            if blocked {
                s.blocks += 1;
            }
            s.last_error = Some(error.to_string());
            s.current_job = None;
        });
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerStats> {
        self.lock().get(worker_id).cloned()
    }

    /// All workers in configuration order (unknown ids appended by name).
    pub fn snapshot(&self) -> Vec<WorkerStats> {
        let guard = self.lock();
        let mut out: Vec<WorkerStats> = self
            .order
            .iter()
            .filter_map(|id| guard.get(id).cloned())
            .collect();
        let mut extra: Vec<WorkerStats> = guard
            .values()
            .filter(|s| !self.order.contains(&s.worker_id))
            .cloned()
            .collect();
        extra.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out.extend(extra);
        out
    }
}

pub(crate) fn job(task_id: Option<&str>, video_url: &str) -> CurrentJob {
    CurrentJob {
        task_id: task_id.map(str::to_string),
        video_url: video_url.to_string(),
        started_ms: now_unix_ms(),
    }
}
