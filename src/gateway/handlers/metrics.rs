use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, future::join_all};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio_stream::wrappers::BroadcastStream;

use crate::dispatch::HealthProbe;
use crate::gateway::{GatewayState, handlers::workers::probe_worker};
use crate::metrics::{AttemptRecord, IpChange, IpChangeReason, MAX_IP_CHANGES, MetricsSummary, VpnMetrics};

const DEFAULT_IP_CHANGE_LIMIT: usize = 50;
/// Tunnels usually need this long to reconnect after a restart.
const RESTART_REFRESH_DELAY: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub(crate) struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TaskAttemptsResponse {
    pub(crate) task_id: String,
    pub(crate) total: usize,
    pub(crate) attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshResponse {
    pub(crate) checked: usize,
    pub(crate) changes: Vec<IpChange>,
}

pub(crate) async fn metrics_summary(State(state): State<GatewayState>) -> Json<MetricsSummary> {
    Json(state.metrics.summary())
}

pub(crate) async fn metrics_worker(
    State(state): State<GatewayState>,
    Path(worker_id): Path<String>,
) -> Result<Json<VpnMetrics>, StatusCode> {
    state
        .metrics
        .worker_metrics(&worker_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub(crate) async fn metrics_ip_changes(
    State(state): State<GatewayState>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<IpChange>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_IP_CHANGE_LIMIT)
        .clamp(1, MAX_IP_CHANGES);
    Json(state.metrics.recent_ip_changes(limit))
}

pub(crate) async fn metrics_task(
    State(state): State<GatewayState>,
    Path(task_id): Path<String>,
) -> Json<TaskAttemptsResponse> {
    let attempts = state.metrics.attempts_for_task(&task_id);
    Json(TaskAttemptsResponse {
        task_id,
        total: attempts.len(),
        attempts,
    })
}

pub(crate) async fn metrics_events(
    State(state): State<GatewayState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.metrics.subscribe();
    let stream = ip_change_sse_stream(
        BroadcastStream::new(rx),
        state.sse_serialize_fallback_total.clone(),
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn ip_change_sse_stream(
    stream: BroadcastStream<IpChange>,
    fallback_counter: Arc<AtomicU64>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    use futures_util::StreamExt as _;

    // Lagged receivers just skip what they missed.
    stream
        .filter_map(|msg| async move { msg.ok() })
        .map(move |change| {
            let json = match serde_json::to_string(&change) {
                Ok(json) => json,
                Err(err) => {
                    let total = fallback_counter.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        error = %err,
                        fallback_total = total,
                        "failed to serialize SSE ip change; emitting fallback"
                    );
                    "{}".to_string()
                }
            };
            Ok(Event::default().event("ip_change").data(json))
        })
}

pub(crate) async fn metrics_refresh_ips(State(state): State<GatewayState>) -> Json<RefreshResponse> {
    let changes = refresh_worker_ips(&state, IpChangeReason::PeriodicCheck).await;
    Json(RefreshResponse {
        checked: state.config.fleet.workers.len(),
        changes,
    })
}

/// Probes every worker's health and feeds the reported IPs into the metrics tracker.
/// Returns the IP changes this revealed.
pub async fn refresh_worker_ips(state: &GatewayState, reason: IpChangeReason) -> Vec<IpChange> {
    let probes = join_all(
        state
            .config
            .fleet
            .workers
            .iter()
            .map(|w| probe_worker(state, w)),
    )
    .await;

    let mut changes = Vec::new();
    for probe in probes {
        let Some(health) = probe.health.as_ref() else {
            tracing::debug!(worker = %probe.worker, error = ?probe.error, "no health for IP check");
            continue;
        };
        let HealthProbe {
            public_ip,
            location,
        } = HealthProbe::from_health_json(health);
        if let Some(ip) = public_ip
            && let Some(change) = state.metrics.update_ip(&probe.worker, &ip, location, reason)
        {
            changes.push(change);
        }
    }
    changes
}

/// After a restart, re-reads the paired worker's IP once the tunnel had time to reconnect.
pub(crate) fn schedule_restart_refresh(state: GatewayState, worker_id: String) {
    tokio::spawn(async move {
        tokio::time::sleep(RESTART_REFRESH_DELAY).await;
        let Some(worker) = state.config.fleet.worker(&worker_id).cloned() else {
            return;
        };
        let probe = probe_worker(&state, &worker).await;
        let Some(health) = probe.health.as_ref() else {
            tracing::info!(worker = %worker_id, "worker not healthy after restart");
            return;
        };
        let HealthProbe {
            public_ip,
            location,
        } = HealthProbe::from_health_json(health);
        if let Some(ip) = public_ip {
            state
                .metrics
                .update_ip(&worker_id, &ip, location, IpChangeReason::Restart);
        }
    });
}
