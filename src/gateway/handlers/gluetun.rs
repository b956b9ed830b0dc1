use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::docker::{ContainerState, client::RESTART_GRACE_SECS};
use crate::gateway::{
    GatewayState,
    error::{ControlError, ControlResult, parse_json_with_limit},
    handlers::{Captured, metrics::schedule_restart_refresh},
};
use crate::metrics::now_unix_ms;
use crate::tunnel::TunnelRunState;

pub(crate) const DEFAULT_LOG_TAIL: usize = 100;
pub(crate) const MAX_LOG_TAIL: usize = 1000;
const MAX_CONTROL_BODY: usize = 4 * 1024;

#[derive(Debug, Deserialize)]
pub(crate) struct ContainerQuery {
    #[serde(default)]
    container: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogsQuery {
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    tail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerRequest {
    container: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RestartMode {
    #[default]
    Soft,
    Hard,
}

#[derive(Debug, Deserialize)]
struct RestartRequest {
    container: String,
    #[serde(default)]
    mode: RestartMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TunnelSnapshot {
    pub(crate) container: String,
    pub(crate) worker: Option<String>,
    pub(crate) timestamp: u64,
    pub(crate) container_state: Captured<ContainerState>,
    pub(crate) vpn_status: Captured<Value>,
    pub(crate) public_ip: Captured<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ControlActionResponse {
    pub(crate) success: bool,
    pub(crate) container: String,
    pub(crate) action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<RestartMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) worker_container: Option<String>,
    pub(crate) message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct LogsResponse {
    pub(crate) success: bool,
    pub(crate) container: String,
    pub(crate) lines: usize,
    pub(crate) logs: Vec<String>,
}

/// Unparseable values fall back to the default; numbers are clamped to `1..=MAX_LOG_TAIL`.
pub(crate) fn clamp_tail(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_LOG_TAIL)
        .clamp(1, MAX_LOG_TAIL)
}

fn tunnel_index(state: &GatewayState, container: &str) -> ControlResult<usize> {
    state
        .config
        .fleet
        .tunnel_index(container)
        .ok_or_else(|| ControlError::UnknownContainer(container.to_string()))
}

async fn tunnel_call<T, F, Fut>(
    state: &GatewayState,
    index: usize,
    call: F,
) -> Result<T, String>
where
    F: FnOnce(crate::tunnel::TunnelControl) -> Fut,
    Fut: std::future::Future<Output = crate::tunnel::Result<T>>,
{
    let Some(tunnel) = state.tunnel_control(index) else {
        return Err("no control URL configured".to_string());
    };
    call(tunnel).await.map_err(|e| e.to_string())
}

async fn snapshot(state: &GatewayState, index: usize) -> TunnelSnapshot {
    let container = state.config.fleet.tunnel_containers[index].clone();
    let (container_state, vpn_status, public_ip) = tokio::join!(
        state.docker.inspect(&container),
        tunnel_call(state, index, |t| async move { t.vpn_status().await }),
        tunnel_call(state, index, |t| async move {
            t.public_ip().await.map(|(_, raw)| raw)
        }),
    );
    TunnelSnapshot {
        worker: state
            .config
            .fleet
            .paired_worker(&container)
            .map(|w| w.id.clone()),
        container,
        timestamp: now_unix_ms(),
        container_state: Captured::from_result(container_state),
        vpn_status: Captured::from_result(vpn_status),
        public_ip: Captured::from_result(public_ip),
    }
}

pub(crate) async fn gluetun_status(
    State(state): State<GatewayState>,
    Query(query): Query<ContainerQuery>,
) -> ControlResult<Response> {
    if let Some(container) = query.container.as_deref().filter(|c| !c.is_empty()) {
        let index = tunnel_index(&state, container)?;
        return Ok(Json(snapshot(&state, index).await).into_response());
    }
    let count = state.config.fleet.tunnel_containers.len();
    let snapshots = join_all((0..count).map(|i| snapshot(&state, i))).await;
    Ok(Json(snapshots).into_response())
}

pub(crate) async fn gluetun_restart(
    State(state): State<GatewayState>,
    body: Bytes,
) -> ControlResult<Json<ControlActionResponse>> {
    let req: RestartRequest = parse_json_with_limit(body, MAX_CONTROL_BODY)?;
    let index = tunnel_index(&state, &req.container)?;
    tracing::info!(container = %req.container, mode = ?req.mode, "tunnel restart requested");

    let worker_container = match req.mode {
        RestartMode::Soft => {
            let tunnel = state
                .tunnel_control(index)
                .ok_or_else(|| ControlError::BadRequest("no control URL configured".into()))?;
            let tunnel_err = |source| ControlError::Tunnel {
                container: req.container.clone(),
                source,
            };
            tunnel
                .set_openvpn_status(TunnelRunState::Stopped)
                .await
                .map_err(tunnel_err)?;
            tokio::time::sleep(Duration::from_millis(state.config.gateway.soft_restart_delay_ms))
                .await;
            tunnel
                .set_openvpn_status(TunnelRunState::Running)
                .await
                .map_err(tunnel_err)?;
            None
        }
        RestartMode::Hard => {
            state.docker.restart(&req.container, RESTART_GRACE_SECS).await?;
            // The worker shares the tunnel's network namespace and loses it on restart.
            let paired = state
                .config
                .fleet
                .paired_worker_container(&req.container)
                .map(str::to_string);
            if let Some(worker) = &paired {
                state.docker.restart(worker, RESTART_GRACE_SECS).await?;
            }
            paired
        }
    };

    if let Some(worker) = state.config.fleet.paired_worker(&req.container) {
        schedule_restart_refresh(state.clone(), worker.id.clone());
    }

    let message = match (&req.mode, &worker_container) {
        (RestartMode::Soft, _) => "VPN connection restarted".to_string(),
        (RestartMode::Hard, Some(w)) => format!("container restarted together with {w}"),
        (RestartMode::Hard, None) => "container restarted".to_string(),
    };
    Ok(Json(ControlActionResponse {
        success: true,
        container: req.container,
        action: "restart",
        mode: Some(req.mode),
        worker_container,
        message,
    }))
}

pub(crate) async fn gluetun_stop_vpn(
    State(state): State<GatewayState>,
    body: Bytes,
) -> ControlResult<Json<ControlActionResponse>> {
    let req: ContainerRequest = parse_json_with_limit(body, MAX_CONTROL_BODY)?;
    let index = tunnel_index(&state, &req.container)?;
    let tunnel = state
        .tunnel_control(index)
        .ok_or_else(|| ControlError::BadRequest("no control URL configured".into()))?;
    tracing::warn!(container = %req.container, "stopping VPN connection");
    tunnel
        .set_openvpn_status(TunnelRunState::Stopped)
        .await
        .map_err(|source| ControlError::Tunnel {
            container: req.container.clone(),
            source,
        })?;
    Ok(Json(ControlActionResponse {
        success: true,
        container: req.container,
        action: "stop-vpn",
        mode: None,
        worker_container: None,
        message: "VPN connection stopped".to_string(),
    }))
}

pub(crate) async fn gluetun_stop_container(
    State(state): State<GatewayState>,
    body: Bytes,
) -> ControlResult<Json<ControlActionResponse>> {
    let req: ContainerRequest = parse_json_with_limit(body, MAX_CONTROL_BODY)?;
    tunnel_index(&state, &req.container)?;
    tracing::warn!(container = %req.container, "stopping tunnel container");
    state.docker.stop(&req.container).await?;
    Ok(Json(ControlActionResponse {
        success: true,
        container: req.container,
        action: "stop-container",
        mode: None,
        worker_container: None,
        message: "container stopped".to_string(),
    }))
}

pub(crate) async fn gluetun_logs(
    State(state): State<GatewayState>,
    Query(query): Query<LogsQuery>,
) -> ControlResult<Json<LogsResponse>> {
    let container = query
        .container
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ControlError::BadRequest("container query parameter is required".into()))?;
    let fleet = &state.config.fleet;
    let allowed = fleet
        .tunnel_containers
        .iter()
        .chain(&fleet.worker_containers)
        .chain(&state.config.gateway.infra_containers)
        .any(|c| *c == container);
    if !allowed {
        return Err(ControlError::UnknownContainer(container));
    }

    let tail = clamp_tail(query.tail.as_deref());
    let logs = state.docker.logs(&container, tail).await?;
    Ok(Json(LogsResponse {
        success: true,
        container,
        lines: logs.len(),
        logs,
    }))
}
