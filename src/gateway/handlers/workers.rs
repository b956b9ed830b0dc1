use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{DispatchStrategy, WorkerEndpointConfig};
use crate::dispatch::WorkerStats;
use crate::gateway::{
    GatewayState,
    error::{ControlError, ControlResult, parse_json_with_limit},
};
use crate::pool::ProxyHealthSnapshot;

const MAX_CONTROL_BODY: usize = 4 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorkerProbe {
    pub(crate) worker: String,
    pub(crate) url: String,
    /// `ok`, `error` (answered non-2xx) or `unreachable`.
    pub(crate) status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) health: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkerQuery {
    #[serde(default)]
    worker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SimulateBlockBody {
    worker: String,
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorkerStatsResponse {
    pub(crate) strategy: DispatchStrategy,
    pub(crate) rotation_index: usize,
    pub(crate) workers: Vec<WorkerStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) pool: Option<Vec<ProxyHealthSnapshot>>,
}

fn base(worker: &WorkerEndpointConfig) -> &str {
    worker.url.trim_end_matches('/')
}

pub(crate) async fn probe_worker(state: &GatewayState, worker: &WorkerEndpointConfig) -> WorkerProbe {
    let url = format!("{}/health", base(worker));
    let resp = state
        .http
        .get(&url)
        .timeout(state.worker_probe_timeout())
        .send()
        .await;
    let mut probe = WorkerProbe {
        worker: worker.id.clone(),
        url: worker.url.clone(),
        status: "unreachable",
        health: None,
        error: None,
    };
    match resp {
        Ok(resp) => {
            let ok = resp.status().is_success();
            let code = resp.status().as_u16();
            match resp.json::<Value>().await {
                Ok(body) => probe.health = Some(body),
                Err(err) => probe.error = Some(format!("invalid health body: {err}")),
            }
            if ok {
                probe.status = "ok";
            } else {
                probe.status = "error";
                probe.error.get_or_insert_with(|| format!("health returned {code}"));
            }
        }
        Err(err) => {
            probe.error = Some(if err.is_timeout() {
                "health check timed out".to_string()
            } else {
                err.to_string()
            });
        }
    }
    probe
}

pub(crate) async fn workers_status(State(state): State<GatewayState>) -> Json<Vec<WorkerProbe>> {
    let probes = join_all(
        state
            .config
            .fleet
            .workers
            .iter()
            .map(|w| probe_worker(&state, w)),
    )
    .await;
    Json(probes)
}

fn lookup_worker<'a>(state: &'a GatewayState, id: &str) -> ControlResult<&'a WorkerEndpointConfig> {
    state
        .config
        .fleet
        .worker(id)
        .ok_or_else(|| ControlError::UnknownWorker(id.to_string()))
}

async fn forward_simulate_block(
    state: &GatewayState,
    worker: &WorkerEndpointConfig,
    set: Option<Option<bool>>,
) -> ControlResult<Value> {
    let url = format!("{}/simulate-block", base(worker));
    let req = match set {
        None => state.http.get(&url),
        Some(enabled) => {
            let body = match enabled {
                Some(enabled) => json!({ "enabled": enabled }),
                None => json!({}),
            };
            state.http.post(&url).json(&body)
        }
    };
    let worker_err = |status: Option<u16>, message: String| ControlError::Worker {
        worker: worker.id.clone(),
        status,
        message,
    };
    let resp = req
        .timeout(state.worker_probe_timeout())
        .send()
        .await
        .map_err(|e| worker_err(None, e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(worker_err(
            Some(status.as_u16()),
            format!("simulate-block returned {}: {}", status.as_u16(), body.trim()),
        ));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| worker_err(None, format!("invalid simulate-block body: {e}")))
}

/// One worker with `?worker=id`, otherwise every worker (failures reported inline).
pub(crate) async fn simulate_block_get(
    State(state): State<GatewayState>,
    Query(query): Query<WorkerQuery>,
) -> ControlResult<Response> {
    if let Some(id) = query.worker.as_deref().filter(|w| !w.is_empty()) {
        let worker = lookup_worker(&state, id)?;
        let body = forward_simulate_block(&state, worker, None).await?;
        return Ok(Json(body).into_response());
    }
    let all = join_all(state.config.fleet.workers.iter().map(|w| {
        let state = &state;
        async move {
            match forward_simulate_block(state, w, None).await {
                Ok(body) => body,
                Err(err) => json!({ "worker": w.id, "error": err.to_string() }),
            }
        }
    }))
    .await;
    Ok(Json(all).into_response())
}

pub(crate) async fn simulate_block_set(
    State(state): State<GatewayState>,
    body: Bytes,
) -> ControlResult<Json<Value>> {
    let req: SimulateBlockBody = parse_json_with_limit(body, MAX_CONTROL_BODY)?;
    let worker = lookup_worker(&state, &req.worker)?;
    tracing::info!(worker = %worker.id, enabled = ?req.enabled, "forwarding simulate-block");
    let body = forward_simulate_block(&state, worker, Some(req.enabled)).await?;
    Ok(Json(body))
}

pub(crate) async fn worker_stats(State(state): State<GatewayState>) -> Json<WorkerStatsResponse> {
    let dispatcher = state.dispatcher();
    Json(WorkerStatsResponse {
        strategy: state.config.dispatcher.strategy,
        rotation_index: dispatcher.rotation_index(),
        workers: dispatcher.stats().snapshot(),
        pool: dispatcher.pool().map(|p| p.snapshot()),
    })
}
