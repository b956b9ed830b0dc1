use axum::{Json, extract::State};
use futures_util::future::join_all;
use serde::Serialize;

use crate::docker::ContainerState;
use crate::gateway::{
    GatewayState,
    handlers::{Captured, ProcessStats},
};
use crate::metrics::now_unix_ms;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InfraSnapshot {
    pub(crate) container: String,
    pub(crate) timestamp: u64,
    pub(crate) container_state: Captured<ContainerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) process: Option<ProcessStats>,
}

pub(crate) async fn infrastructure_status(
    State(state): State<GatewayState>,
) -> Json<Vec<InfraSnapshot>> {
    let snapshots = join_all(state.config.gateway.infra_containers.iter().map(|name| {
        let state = &state;
        async move {
            let container_state = Captured::from_result(state.docker.inspect(name).await);
            let process = if *name == state.config.gateway.self_container {
                Some(ProcessStats::collect(state.started_at).await)
            } else {
                None
            };
            InfraSnapshot {
                container: name.clone(),
                timestamp: now_unix_ms(),
                container_state,
                process,
            }
        }
    }))
    .await;
    Json(snapshots)
}
