use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::io::ReaderStream;

use crate::dispatch::SliceRequest;
use crate::logging::{redact_url, warn_throttled};
use crate::metrics::now_unix_ms;
use crate::worker::{MAX_REQUEST_BYTES, WorkerState, ytdlp::AUDIO_CONTENT_TYPE};

pub(crate) const X_WORKER_ID: HeaderName = HeaderName::from_static("x-worker-id");
pub(crate) const X_VPN_IP: HeaderName = HeaderName::from_static("x-vpn-ip");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorkerErrorBody {
    pub(crate) error: String,
    pub(crate) blocked: bool,
    pub(crate) worker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) vpn_down: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) simulated: Option<bool>,
}

fn reject(status: StatusCode, body: WorkerErrorBody) -> Response {
    (status, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SimulateBlockResponse {
    pub(crate) worker: String,
    pub(crate) simulate_block: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SimulateBlockRequest {
    #[serde(default)]
    pub(crate) enabled: Option<bool>,
}

pub(crate) async fn health(State(state): State<WorkerState>) -> Json<Value> {
    let (status, ip) = tokio::join!(state.tunnel.vpn_status(), state.tunnel.public_ip());
    let vpn = match ip {
        Ok((_, raw)) => raw,
        Err(err) => json!({ "error": err.to_string() }),
    };
    let vpn_status = match status {
        Ok(raw) => raw,
        Err(err) => json!({ "error": err.to_string() }),
    };
    Json(json!({
        "worker": state.worker_id(),
        "status": "ok",
        "vpn": vpn,
        "vpnStatus": vpn_status,
        "timestamp": now_unix_ms(),
    }))
}

pub(crate) async fn simulate_block_get(
    State(state): State<WorkerState>,
) -> Json<SimulateBlockResponse> {
    Json(SimulateBlockResponse {
        worker: state.worker_id().to_string(),
        simulate_block: state.simulate_block(),
    })
}

/// An empty body (or one without `enabled`) flips the current value.
pub(crate) async fn simulate_block_set(
    State(state): State<WorkerState>,
    body: Bytes,
) -> Result<Json<SimulateBlockResponse>, StatusCode> {
    let req: SimulateBlockRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SimulateBlockRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };
    let enabled = req.enabled.unwrap_or(!state.simulate_block());
    state.set_simulate_block(enabled);
    tracing::info!(worker = state.worker_id(), enabled, "simulate-block updated");
    Ok(Json(SimulateBlockResponse {
        worker: state.worker_id().to_string(),
        simulate_block: enabled,
    }))
}

pub(crate) async fn download(State(state): State<WorkerState>, body: Bytes) -> Response {
    let worker = state.worker_id().to_string();
    let bad_request = |error: String| {
        reject(
            StatusCode::BAD_REQUEST,
            WorkerErrorBody {
                error,
                blocked: false,
                worker: worker.clone(),
                vpn_down: None,
                simulated: None,
            },
        )
    };
    if body.len() > MAX_REQUEST_BYTES {
        return bad_request("request body too large".to_string());
    }
    let req: SliceRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => return bad_request(format!("invalid request body: {err}")),
    };
    if let Err(msg) = req.validate() {
        return bad_request(msg);
    }

    // Pre-flight: never hand a dead tunnel to the tool.
    let ip = match state.tunnel.require_public_ip().await {
        Ok(info) => info,
        Err(err) => {
            if warn_throttled("worker_preflight_failed", Duration::from_secs(30)) {
                tracing::warn!(worker = %worker, error = %err, "tunnel pre-flight failed");
            }
            return reject(
                StatusCode::SERVICE_UNAVAILABLE,
                WorkerErrorBody {
                    error: format!("VPN not connected: {err}"),
                    blocked: false,
                    worker,
                    vpn_down: Some(true),
                    simulated: None,
                },
            );
        }
    };

    if state.simulate_block() {
        tracing::info!(worker = %worker, "returning simulated block");
        return reject(
            StatusCode::FORBIDDEN,
            WorkerErrorBody {
                error: "Simulated block".to_string(),
                blocked: true,
                worker,
                vpn_down: None,
                simulated: Some(true),
            },
        );
    }

    let path = match state.tool.extract(&req.video_url, req.start_ms, req.end_ms).await {
        Ok(path) => path,
        Err(err) => {
            let blocked = err.is_block();
            tracing::warn!(
                worker = %worker,
                ip = %ip.public_ip,
                url = %redact_url(&req.video_url),
                blocked,
                error = %err,
                "download failed"
            );
            let status = if blocked {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return reject(
                status,
                WorkerErrorBody {
                    error: err.to_string(),
                    blocked,
                    worker,
                    vpn_down: None,
                    simulated: None,
                },
            );
        }
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            return reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                WorkerErrorBody {
                    error: format!("failed to open {}: {err}", path.display()),
                    blocked: false,
                    worker,
                    vpn_down: None,
                    simulated: None,
                },
            );
        }
    };
    let len = file.metadata().await.map(|m| m.len()).ok();
    // The open handle keeps the data readable; nothing else needs the path.
    if let Err(err) = tokio::fs::remove_file(&path).await {
        tracing::debug!(path = %path.display(), error = %err, "failed to unlink finished clip");
    }

    tracing::info!(worker = %worker, ip = %ip.public_ip, bytes = ?len, "streaming clip");
    let mut resp = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(AUDIO_CONTENT_TYPE));
    if let Some(len) = len {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    if let Ok(v) = HeaderValue::from_str(&worker) {
        headers.insert(X_WORKER_ID, v);
    }
    if let Ok(v) = HeaderValue::from_str(&ip.public_ip) {
        headers.insert(X_VPN_IP, v);
    }
    resp
}
