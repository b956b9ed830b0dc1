mod core;
mod downloads;
mod gluetun;
mod infrastructure;
mod metrics;
mod workers;

use serde::Serialize;

pub(crate) use self::core::{ProcessStats, health};
pub(crate) use downloads::downloads_create;
pub(crate) use gluetun::{
    gluetun_logs, gluetun_restart, gluetun_status, gluetun_stop_container, gluetun_stop_vpn,
};
pub(crate) use infrastructure::infrastructure_status;
pub(crate) use metrics::{
    metrics_events, metrics_ip_changes, metrics_refresh_ips, metrics_summary, metrics_task,
    metrics_worker,
};
pub use metrics::refresh_worker_ips;
pub(crate) use workers::{
    simulate_block_get, simulate_block_set, worker_stats, workers_status,
};

#[cfg(test)]
pub(crate) use gluetun::{clamp_tail, DEFAULT_LOG_TAIL, MAX_LOG_TAIL};

/// One branch of a fan-out query: its value, or the error that branch hit.
/// Sibling branches are never aborted by a failing one.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub(crate) enum Captured<T> {
    Ok(T),
    Err { error: String },
}

impl<T> Captured<T> {
    pub(crate) fn from_result<E: std::fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Err {
                error: e.to_string(),
            },
        }
    }
}
