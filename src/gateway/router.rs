use axum::{
    Router,
    routing::{MethodRouter, get, post},
};

use crate::gateway::{
    GatewayState,
    handlers::{
        downloads_create, gluetun_logs, gluetun_restart, gluetun_status, gluetun_stop_container,
        gluetun_stop_vpn, health, infrastructure_status, metrics_events, metrics_ip_changes,
        metrics_refresh_ips, metrics_summary, metrics_task, metrics_worker, simulate_block_get,
        simulate_block_set, worker_stats, workers_status,
    },
    proxy::proxy,
};

/// Methods a control route does not serve go to the primary server instead of a 405.
fn or_proxy(route: MethodRouter<GatewayState>) -> MethodRouter<GatewayState> {
    route.fallback(proxy)
}

/// Control-plane routes under `/manager`; anything else falls through to the reverse proxy.
pub fn build_app(state: GatewayState) -> Router<()> {
    let manager = Router::new()
        .route("/gluetun/status", or_proxy(get(gluetun_status)))
        .route("/gluetun/restart", or_proxy(post(gluetun_restart)))
        .route("/gluetun/stop-vpn", or_proxy(post(gluetun_stop_vpn)))
        .route("/gluetun/stop-container", or_proxy(post(gluetun_stop_container)))
        .route("/gluetun/logs", or_proxy(get(gluetun_logs)))
        .route("/workers/status", or_proxy(get(workers_status)))
        .route("/workers/stats", or_proxy(get(worker_stats)))
        .route(
            "/workers/simulate-block",
            or_proxy(get(simulate_block_get).post(simulate_block_set)),
        )
        .route("/infrastructure/status", or_proxy(get(infrastructure_status)))
        .route("/downloads", or_proxy(post(downloads_create)))
        .route("/metrics", or_proxy(get(metrics_summary)))
        .route("/metrics/workers/:worker_id", or_proxy(get(metrics_worker)))
        .route("/metrics/ip-changes", or_proxy(get(metrics_ip_changes)))
        .route("/metrics/tasks/:task_id", or_proxy(get(metrics_task)))
        .route("/metrics/events", or_proxy(get(metrics_events)))
        .route("/metrics/refresh-ips", or_proxy(post(metrics_refresh_ips)));

    Router::new()
        .route("/health", or_proxy(get(health)))
        .nest("/manager", manager)
        .fallback(proxy)
        .with_state(state)
}
