//! Fleet gateway: transparent reverse proxy to the primary application server plus the
//! `/manager/` control plane over the tunnel and worker containers.

use axum::middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use crate::config::{Config, DispatchStrategy};
use crate::dispatch::{CandidateOrder, HttpWorkerTransport, VpnDownloadManager, WorkerEndpoint};
use crate::docker::DockerClient;
use crate::metrics::MetricsTracker;
use crate::pool::HealthScoredPool;
use crate::tunnel::TunnelControl;

pub mod error;
mod handlers;
mod proxy;
mod router;


pub use error::{ControlError, ControlResult};
pub use handlers::refresh_worker_ips;
pub use router::build_app;

pub type GatewayDispatcher = VpnDownloadManager<HttpWorkerTransport>;

#[derive(Clone)]
pub struct GatewayState {
    pub(crate) config: Arc<Config>,
    pub(crate) docker: DockerClient,
    /// Control-plane calls (tunnel APIs, worker probes).
    pub(crate) http: reqwest::Client,
    /// Reverse proxy; never follows redirects.
    pub(crate) proxy_http: reqwest::Client,
    pub(crate) dispatcher: Arc<GatewayDispatcher>,
    pub(crate) metrics: Arc<MetricsTracker>,
    pub(crate) started_at: Instant,
    pub(crate) sse_serialize_fallback_total: Arc<AtomicU64>,
}

impl GatewayState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        let proxy_http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.gateway.proxy_timeout_secs.max(1)))
            .build()?;

        let workers = config
            .fleet
            .workers
            .iter()
            .map(|w| WorkerEndpoint::from_config(w).map_err(|e| anyhow::anyhow!("invalid worker: {e}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let metrics = Arc::new(MetricsTracker::new());
        let transport = HttpWorkerTransport::new(
            http.clone(),
            Duration::from_secs(config.dispatcher.health_timeout_secs.max(1)),
            Duration::from_secs(config.dispatcher.download_timeout_secs.max(1)),
        );
        let order = match config.dispatcher.strategy {
            DispatchStrategy::Rotation => CandidateOrder::Rotation,
            DispatchStrategy::HealthScored => CandidateOrder::HealthScored(Arc::new(
                HealthScoredPool::new(workers.iter().map(|w| w.id.clone())),
            )),
        };
        let dispatcher = VpnDownloadManager::new(
            workers,
            transport,
            metrics.clone(),
            config.dispatcher_output_dir(),
        )
        .with_order(order);

        let docker = DockerClient::new(
            &config.gateway.docker_socket,
            Duration::from_millis(config.gateway.docker_timeout_ms.max(1)),
        );

        Ok(Self {
            config: Arc::new(config),
            docker,
            http,
            proxy_http,
            dispatcher: Arc::new(dispatcher),
            metrics,
            started_at: Instant::now(),
            sse_serialize_fallback_total: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn dispatcher(&self) -> &Arc<GatewayDispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    /// Control client for the tunnel at `index` in the fleet lists.
    pub(crate) fn tunnel_control(&self, index: usize) -> Option<TunnelControl> {
        let url = self.config.fleet.tunnel_control_urls.get(index)?;
        Some(TunnelControl::new(
            url,
            self.http.clone(),
            Duration::from_millis(self.config.gateway.tunnel_timeout_ms.max(1)),
        ))
    }

    pub(crate) fn worker_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.config.gateway.worker_probe_timeout_ms.max(1))
    }
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let bind_ip: std::net::IpAddr = config
        .gateway
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid gateway.host '{}': {e}", config.gateway.host))?;
    let addr = SocketAddr::new(bind_ip, config.gateway.port);
    let state = GatewayState::new(config)?;
    serve_with_listener(tokio::net::TcpListener::bind(addr).await?, state).await
}

/// Serves on an already-bound listener; lets tests pick an ephemeral port.
pub async fn serve_with_listener(
    listener: tokio::net::TcpListener,
    state: GatewayState,
) -> anyhow::Result<()> {
    let interval = state.config.gateway.ip_check_interval_secs;
    if interval > 0 {
        tokio::spawn(ip_check_loop(state.clone(), Duration::from_secs(interval)));
    }

    tracing::info!(
        addr = %listener.local_addr()?,
        primary = %state.config.gateway.primary_url,
        docker = %state.docker.socket_path().display(),
        tunnels = state.config.fleet.tunnel_containers.len(),
        workers = state.config.fleet.workers.len(),
        "gateway listening"
    );
    let app = build_app(state).layer(middleware::from_fn(error::error_envelope_mw));
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ip_check_loop(state: GatewayState, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let changed = refresh_worker_ips(&state, crate::metrics::IpChangeReason::PeriodicCheck).await;
        tracing::debug!(changed = changed.len(), "periodic worker IP check done");
    }
}
