use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::now_unix_ms;
use super::types::{
    AttemptRecord, IpChange, IpChangeReason, MAX_ALL_ATTEMPTS, MAX_IP_CHANGES,
    MAX_REQUESTS_PER_IP, MetricsSummary, VpnIpHistory, VpnMetrics, WorkerSummary, push_bounded,
    rate,
};

/// One finished attempt as reported by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub worker_id: String,
    pub ip: Option<String>,
    pub location: Option<String>,
    pub video_url: String,
    pub success: bool,
    pub error: Option<String>,
    pub task_id: Option<String>,
}

/// Per-worker reliability ledger with IP rotation detection.
///
/// Shared between the dispatcher (writer) and the gateway (reader) behind an `Arc`.
pub struct MetricsTracker {
    workers: Mutex<HashMap<String, VpnMetrics>>,
    next_sequence: AtomicU64,
    ip_change_tx: broadcast::Sender<IpChange>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTracker {
    pub fn new() -> Self {
        let (ip_change_tx, _rx) = broadcast::channel(256);
        Self {
            workers: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            ip_change_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VpnMetrics>> {
        match self.workers.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("metrics lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IpChange> {
        self.ip_change_tx.subscribe()
    }

    /// Records one attempt. Returns the IP change it revealed, if any.
    pub fn record_request(&self, outcome: RequestOutcome) -> Option<IpChange> {
        self.record_request_at(outcome, now_unix_ms())
    }

    fn record_request_at(&self, outcome: RequestOutcome, now_ms: u64) -> Option<IpChange> {
        let ip = outcome
            .ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string);
        let record = AttemptRecord {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms,
            worker_id: outcome.worker_id.clone(),
            ip: ip.clone(),
            location: outcome.location.clone(),
            video_url: outcome.video_url,
            success: outcome.success,
            error: outcome.error,
            task_id: outcome.task_id,
        };

        let change = {
            let mut workers = self.lock();
            let m = workers
                .entry(outcome.worker_id.clone())
                .or_insert_with(|| VpnMetrics::new(&outcome.worker_id));

            let mut change = None;
            if let Some(ip) = ip.as_deref() {
                change = observe_ip(
                    m,
                    ip,
                    outcome.location.clone(),
                    now_ms,
                    IpChangeReason::DetectedOnRequest,
                );
                m.current_ip_requests += 1;
                if record.success {
                    m.current_ip_success += 1;
                } else {
                    m.current_ip_failures += 1;
                }

                let hist = history_entry(m, ip, outcome.location.clone(), now_ms);
                hist.last_seen_ms = now_ms;
                hist.request_count += 1;
                if record.success {
                    hist.success_count += 1;
                } else {
                    hist.failure_count += 1;
                }
                push_bounded(&mut hist.requests, record.clone(), MAX_REQUESTS_PER_IP);
            }

            m.total_requests += 1;
            if record.success {
                m.total_success += 1;
            } else {
                m.total_failures += 1;
            }
            push_bounded(&mut m.all_attempts, record, MAX_ALL_ATTEMPTS);
            change
        };

        if let Some(change) = &change {
            self.announce(change);
        }
        change
    }

    /// Updates the observed IP outside of a download (health sweep, restart).
    pub fn update_ip(
        &self,
        worker_id: &str,
        ip: &str,
        location: Option<String>,
        reason: IpChangeReason,
    ) -> Option<IpChange> {
        let ip = ip.trim();
        let now_ms = now_unix_ms();
        let change = {
            let mut workers = self.lock();
            let m = workers
                .entry(worker_id.to_string())
                .or_insert_with(|| VpnMetrics::new(worker_id));
            if ip.is_empty() {
                m.last_checked_ms = Some(now_ms);
                return None;
            }
            let change = observe_ip(m, ip, location.clone(), now_ms, reason);
            history_entry(m, ip, location, now_ms).last_seen_ms = now_ms;
            change
        };
        if let Some(change) = &change {
            self.announce(change);
        }
        change
    }

    fn announce(&self, change: &IpChange) {
        tracing::info!(
            worker = %change.worker_id,
            old_ip = ?change.old_ip,
            new_ip = %change.new_ip,
            new_location = ?change.new_location,
            reason = ?change.reason,
            "tunnel IP changed"
        );
        // No subscribers is fine.
        let _ = self.ip_change_tx.send(change.clone());
    }

    pub fn worker_metrics(&self, worker_id: &str) -> Option<VpnMetrics> {
        self.lock().get(worker_id).cloned()
    }

    pub fn all_metrics(&self) -> Vec<VpnMetrics> {
        let mut out: Vec<VpnMetrics> = self.lock().values().cloned().collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    pub fn summary(&self) -> MetricsSummary {
        let workers = self.lock();
        let mut summaries: Vec<WorkerSummary> = workers
            .values()
            .map(|m| WorkerSummary {
                worker_id: m.worker_id.clone(),
                current_ip: m.current_ip.clone(),
                current_location: m.current_location.clone(),
                last_checked_ms: m.last_checked_ms,
                total_requests: m.total_requests,
                total_success: m.total_success,
                total_failures: m.total_failures,
                success_rate: m.success_rate(),
                current_ip_requests: m.current_ip_requests,
                current_ip_success_rate: rate(m.current_ip_success, m.current_ip_requests),
                ip_changes: m.ip_changes.len(),
                unique_ips: m.ip_history.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let total_requests = workers.values().map(|m| m.total_requests).sum();
        let total_success = workers.values().map(|m| m.total_success).sum();
        let unique_ips = workers
            .values()
            .flat_map(|m| m.ip_history.iter().map(|h| h.ip.as_str()))
            .collect::<HashSet<_>>()
            .len();

        MetricsSummary {
            total_workers: workers.len(),
            total_requests,
            total_success,
            total_failures: workers.values().map(|m| m.total_failures).sum(),
            success_rate: rate(total_success, total_requests),
            total_ip_changes: workers.values().map(|m| m.ip_changes.len()).sum(),
            unique_ips,
            workers: summaries,
        }
    }

    /// Most recent IP changes across all workers, newest first.
    pub fn recent_ip_changes(&self, limit: usize) -> Vec<IpChange> {
        let mut changes: Vec<IpChange> = self
            .lock()
            .values()
            .flat_map(|m| m.ip_changes.iter().cloned())
            .collect();
        changes.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        changes.truncate(limit);
        changes
    }

    /// Every retained attempt for a task, oldest first, across workers.
    pub fn attempts_for_task(&self, task_id: &str) -> Vec<AttemptRecord> {
        let mut attempts: Vec<AttemptRecord> = self
            .lock()
            .values()
            .flat_map(|m| m.all_attempts.iter())
            .filter(|a| a.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.sequence);
        attempts
    }
}

fn observe_ip(
    m: &mut VpnMetrics,
    ip: &str,
    location: Option<String>,
    now_ms: u64,
    reason: IpChangeReason,
) -> Option<IpChange> {
    m.last_checked_ms = Some(now_ms);
    if m.current_ip.as_deref() == Some(ip) {
        if location.is_some() {
            m.current_location = location;
        }
        return None;
    }

    let previous = m.current_ip.take();
    let previous_location = m.current_location.take();
    m.current_ip = Some(ip.to_string());
    m.current_location = location.clone();

    // The first IP ever seen is not a rotation.
    let old_ip = previous?;
    let change = IpChange {
        worker_id: m.worker_id.clone(),
        old_ip: Some(old_ip),
        old_location: previous_location,
        new_ip: ip.to_string(),
        new_location: location,
        timestamp_ms: now_ms,
        reason,
    };
    m.current_ip_requests = 0;
    m.current_ip_success = 0;
    m.current_ip_failures = 0;
    push_bounded(&mut m.ip_changes, change.clone(), MAX_IP_CHANGES);
    Some(change)
}

fn history_entry<'a>(
    m: &'a mut VpnMetrics,
    ip: &str,
    location: Option<String>,
    now_ms: u64,
) -> &'a mut VpnIpHistory {
    let idx = match m.ip_history.iter().position(|h| h.ip == ip) {
        Some(idx) => idx,
        None => {
            m.ip_history
                .push(VpnIpHistory::new(ip, location.clone(), now_ms));
            m.ip_history.len() - 1
        }
    };
    let entry = &mut m.ip_history[idx];
    if location.is_some() {
        entry.location = location;
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(worker: &str, ip: Option<&str>, success: bool) -> RequestOutcome {
        RequestOutcome {
            worker_id: worker.to_string(),
            ip: ip.map(str::to_string),
            location: ip.map(|_| "Amsterdam, Netherlands".to_string()),
            video_url: "https://www.youtube.com/watch?v=abc".to_string(),
            success,
            error: (!success).then(|| "failed".to_string()),
            task_id: Some("task-1".to_string()),
        }
    }

    #[test]
    fn lifetime_totals_always_balance() {
        let t = MetricsTracker::new();
        t.record_request(outcome("w1", Some("1.1.1.1"), true));
        t.record_request(outcome("w1", None, false));
        t.record_request(outcome("w1", Some("1.1.1.1"), false));

        let m = t.worker_metrics("w1").unwrap();
        assert_eq!(m.total_requests, 3);
        assert_eq!(m.total_requests, m.total_success + m.total_failures);
        assert_eq!(m.all_attempts.len(), 3);
        // Unknown-IP attempt is in the ledger but not counted against the current IP.
        assert_eq!(m.current_ip_requests, 2);
        assert!(m.all_attempts[1].ip.is_none());
    }

    #[test]
    fn new_ip_appends_one_change_and_resets_current_counters() {
        let t = MetricsTracker::new();
        t.record_request(outcome("w1", Some("1.1.1.1"), true));
        t.record_request(outcome("w1", Some("1.1.1.1"), false));
        let before = t.worker_metrics("w1").unwrap();
        assert!(before.ip_changes.is_empty());
        assert_eq!(before.current_ip_requests, 2);

        let change = t.update_ip("w1", "2.2.2.2", None, IpChangeReason::PeriodicCheck);
        let change = change.expect("ip change");
        assert_eq!(change.old_ip.as_deref(), Some("1.1.1.1"));
        assert_eq!(change.new_ip, "2.2.2.2");

        let after = t.worker_metrics("w1").unwrap();
        assert_eq!(after.ip_changes.len(), 1);
        assert_eq!(after.current_ip_requests, 0);
        assert_eq!(after.current_ip_success, 0);
        assert_eq!(after.current_ip_failures, 0);
        assert_eq!(after.total_requests, before.total_requests);
        assert_eq!(after.total_success, before.total_success);
        assert_eq!(after.total_failures, before.total_failures);
        assert_eq!(after.ip_history.len(), 2);
    }

    #[test]
    fn change_detected_on_request_counts_the_new_request() {
        let t = MetricsTracker::new();
        t.record_request(outcome("w1", Some("1.1.1.1"), true));
        let change = t.record_request(outcome("w1", Some("3.3.3.3"), true));
        assert_eq!(change.unwrap().reason, IpChangeReason::DetectedOnRequest);

        let m = t.worker_metrics("w1").unwrap();
        assert_eq!(m.ip_changes.len(), 1);
        assert_eq!(m.current_ip_requests, 1);
        assert_eq!(m.total_requests, 2);
    }

    #[test]
    fn same_ip_is_not_a_change() {
        let t = MetricsTracker::new();
        assert!(t.update_ip("w1", "1.1.1.1", None, IpChangeReason::Manual).is_none());
        assert!(t.update_ip("w1", "1.1.1.1", None, IpChangeReason::Manual).is_none());
        assert!(t.worker_metrics("w1").unwrap().ip_changes.is_empty());
    }

    #[test]
    fn attempt_ledger_is_bounded_fifo() {
        let t = MetricsTracker::new();
        for i in 0..(MAX_ALL_ATTEMPTS + 25) {
            let mut o = outcome("w1", Some("1.1.1.1"), true);
            o.task_id = Some(format!("t{i}"));
            t.record_request_at(o, i as u64);
        }
        let m = t.worker_metrics("w1").unwrap();
        assert_eq!(m.all_attempts.len(), MAX_ALL_ATTEMPTS);
        assert_eq!(m.all_attempts.front().unwrap().task_id.as_deref(), Some("t25"));

        let hist = &m.ip_history[0];
        assert_eq!(hist.requests.len(), MAX_REQUESTS_PER_IP);
        let expected = format!("t{}", MAX_ALL_ATTEMPTS + 25 - MAX_REQUESTS_PER_IP);
        assert_eq!(
            hist.requests.front().unwrap().task_id.as_deref(),
            Some(expected.as_str())
        );
        assert_eq!(hist.request_count, (MAX_ALL_ATTEMPTS + 25) as u64);
    }

    #[test]
    fn attempts_for_task_span_workers_in_time_order() {
        let t = MetricsTracker::new();
        t.record_request_at(outcome("w2", None, false), 10);
        t.record_request_at(outcome("w1", Some("1.1.1.1"), true), 20);
        let mut other = outcome("w1", Some("1.1.1.1"), true);
        other.task_id = Some("task-2".to_string());
        t.record_request_at(other, 30);

        let attempts = t.attempts_for_task("task-1");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].worker_id, "w2");
        assert_eq!(attempts[1].worker_id, "w1");
    }

    #[test]
    fn summary_aggregates_workers() {
        let t = MetricsTracker::new();
        t.record_request(outcome("w1", Some("1.1.1.1"), true));
        t.record_request(outcome("w2", Some("2.2.2.2"), false));
        t.update_ip("w2", "4.4.4.4", None, IpChangeReason::Restart);

        let s = t.summary();
        assert_eq!(s.total_workers, 2);
        assert_eq!(s.total_requests, 2);
        assert_eq!(s.total_success, 1);
        assert_eq!(s.success_rate, 50.0);
        assert_eq!(s.total_ip_changes, 1);
        assert_eq!(s.unique_ips, 3);
        assert_eq!(s.workers[0].worker_id, "w1");
        assert_eq!(t.recent_ip_changes(10).len(), 1);

        let all = t.all_metrics();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].current_ip.as_deref(), Some("4.4.4.4"));
        assert_eq!(all[1].current_ip_requests, 0);
    }

    #[tokio::test]
    async fn subscribers_receive_ip_changes() {
        let t = MetricsTracker::new();
        let mut rx = t.subscribe();
        t.update_ip("w1", "1.1.1.1", None, IpChangeReason::Manual);
        t.update_ip("w1", "5.5.5.5", None, IpChangeReason::Manual);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.new_ip, "5.5.5.5");
    }
}
