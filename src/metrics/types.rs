use serde::Serialize;
use std::collections::VecDeque;

pub const MAX_ALL_ATTEMPTS: usize = 1000;
pub const MAX_REQUESTS_PER_IP: usize = 100;
pub const MAX_IP_CHANGES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// Tracker-wide insertion order; breaks timestamp ties across workers.
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub worker_id: String,
    pub ip: Option<String>,
    pub location: Option<String>,
    pub video_url: String,
    pub success: bool,
    pub error: Option<String>,
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IpChangeReason {
    /// Seen on a download attempt.
    DetectedOnRequest,
    /// Seen by a background or operator-triggered health sweep.
    PeriodicCheck,
    /// After a tunnel restart issued through the gateway.
    Restart,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpChange {
    pub worker_id: String,
    pub old_ip: Option<String>,
    pub old_location: Option<String>,
    pub new_ip: String,
    pub new_location: Option<String>,
    pub timestamp_ms: u64,
    pub reason: IpChangeReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnIpHistory {
    pub ip: String,
    pub location: Option<String>,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub requests: VecDeque<AttemptRecord>,
}

impl VpnIpHistory {
    pub(crate) fn new(ip: &str, location: Option<String>, now_ms: u64) -> Self {
        Self {
            ip: ip.to_string(),
            location,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            requests: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnMetrics {
    pub worker_id: String,
    pub current_ip: Option<String>,
    pub current_location: Option<String>,
    pub last_checked_ms: Option<u64>,
    pub ip_history: Vec<VpnIpHistory>,

    pub total_requests: u64,
    pub total_success: u64,
    pub total_failures: u64,

    /// Reset to zero whenever the observed IP changes.
    pub current_ip_requests: u64,
    pub current_ip_success: u64,
    pub current_ip_failures: u64,

    pub ip_changes: VecDeque<IpChange>,
    pub all_attempts: VecDeque<AttemptRecord>,
}

impl VpnMetrics {
    pub(crate) fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            current_ip: None,
            current_location: None,
            last_checked_ms: None,
            ip_history: Vec::new(),
            total_requests: 0,
            total_success: 0,
            total_failures: 0,
            current_ip_requests: 0,
            current_ip_success: 0,
            current_ip_failures: 0,
            ip_changes: VecDeque::new(),
            all_attempts: VecDeque::new(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        rate(self.total_success, self.total_requests)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub worker_id: String,
    pub current_ip: Option<String>,
    pub current_location: Option<String>,
    pub last_checked_ms: Option<u64>,
    pub total_requests: u64,
    pub total_success: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub current_ip_requests: u64,
    pub current_ip_success_rate: f64,
    pub ip_changes: usize,
    pub unique_ips: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_workers: usize,
    pub total_requests: u64,
    pub total_success: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub total_ip_changes: usize,
    pub unique_ips: usize,
    pub workers: Vec<WorkerSummary>,
}

/// Percentage in `0.0..=100.0`; `0.0` when nothing was recorded.
pub fn rate(success: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (success as f64 / total as f64) * 100.0
}

pub(crate) fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    while buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(item);
}
