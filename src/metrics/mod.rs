pub mod tracker;
pub mod types;

pub use tracker::{MetricsTracker, RequestOutcome};
pub use types::{
    AttemptRecord, IpChange, IpChangeReason, MAX_ALL_ATTEMPTS, MAX_IP_CHANGES,
    MAX_REQUESTS_PER_IP, MetricsSummary, VpnIpHistory, VpnMetrics, WorkerSummary,
};

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
