//! One download worker bound to one tunnel. All of its outbound traffic leaves through that
//! tunnel, so the worker checks the tunnel's public IP before every job.

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::tunnel::TunnelControl;

mod handlers;
pub mod timecode;
pub mod ytdlp;


pub use ytdlp::{AUDIO_CONTENT_TYPE, AUDIO_FORMAT, ToolError, YtDlp};

pub const TUNNEL_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_REQUEST_BYTES: usize = 16 * 1024;

#[derive(Clone)]
pub struct WorkerState {
    worker_id: Arc<str>,
    tunnel: TunnelControl,
    tool: YtDlp,
    simulate_block: Arc<AtomicBool>,
}

impl WorkerState {
    pub fn new(worker_id: impl Into<Arc<str>>, tunnel: TunnelControl, tool: YtDlp) -> Self {
        Self {
            worker_id: worker_id.into(),
            tunnel,
            tool,
            simulate_block: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(cfg: &WorkerConfig, http: reqwest::Client) -> Self {
        Self::new(
            cfg.id.as_str(),
            TunnelControl::new(&cfg.tunnel_control_url, http, TUNNEL_TIMEOUT),
            YtDlp::from_config(cfg),
        )
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn simulate_block(&self) -> bool {
        self.simulate_block.load(Ordering::SeqCst)
    }

    pub fn set_simulate_block(&self, enabled: bool) {
        self.simulate_block.store(enabled, Ordering::SeqCst);
    }
}

pub fn build_app(state: WorkerState) -> Router<()> {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/simulate-block",
            get(handlers::simulate_block_get).post(handlers::simulate_block_set),
        )
        .route("/download", post(handlers::download))
        .with_state(state)
}

pub async fn serve(cfg: &WorkerConfig) -> anyhow::Result<()> {
    let bind_ip: std::net::IpAddr = cfg
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid worker.host '{}': {e}", cfg.host))?;
    let addr = SocketAddr::new(bind_ip, cfg.port);

    let http = reqwest::Client::builder().build()?;
    let state = WorkerState::from_config(cfg, http);
    let app = build_app(state);

    tracing::info!(
        addr = %addr,
        worker = %cfg.id,
        tunnel = %cfg.tunnel_control_url,
        "worker listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
