use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_gateway_host() -> String {
    "0.0.0.0".to_string()
}
fn default_gateway_port() -> u16 {
    8080
}
fn default_primary_url() -> String {
    "http://app-server:3000".to_string()
}
fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}
fn default_self_container() -> String {
    "vpn-manager".to_string()
}
fn default_infra_containers() -> Vec<String> {
    vec![
        "vpn-manager".to_string(),
        "app-server".to_string(),
        "redis".to_string(),
    ]
}
fn default_soft_restart_delay_ms() -> u64 {
    // Gluetun needs a moment to tear the tunnel down before it accepts "running" again.
    2000
}
fn default_tunnel_timeout_ms() -> u64 {
    5000
}
fn default_worker_probe_timeout_ms() -> u64 {
    5000
}
fn default_docker_timeout_ms() -> u64 {
    // Container restarts block on the stop timeout (t=10) before returning.
    30_000
}
fn default_proxy_timeout_secs() -> u64 {
    300
}
fn default_max_proxy_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_ip_check_interval_secs() -> u64 {
    0
}
fn default_worker_id() -> String {
    "worker-1".to_string()
}
fn default_worker_host() -> String {
    "0.0.0.0".to_string()
}
fn default_worker_port() -> u16 {
    3001
}
fn default_tunnel_control_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}
fn default_worker_output_dir() -> String {
    "/tmp/vpn-worker".to_string()
}
fn default_tool_timeout_secs() -> u64 {
    // Stay under the dispatcher's 120s download timeout so the worker reports the failure itself.
    110
}
fn default_dispatch_strategy() -> DispatchStrategy {
    DispatchStrategy::Rotation
}
fn default_download_timeout_secs() -> u64 {
    120
}
fn default_health_timeout_secs() -> u64 {
    5
}
fn default_dispatch_output_dir() -> String {
    "clips".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub gateway: GatewayConfig,
    pub fleet: FleetConfig,
    pub worker: WorkerConfig,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Everything that is not a control-plane route is forwarded here.
    pub primary_url: String,
    pub docker_socket: String,
    /// Name of the container the gateway itself runs in (gets process stats attached).
    pub self_container: String,
    pub infra_containers: Vec<String>,
    pub soft_restart_delay_ms: u64,
    pub tunnel_timeout_ms: u64,
    pub worker_probe_timeout_ms: u64,
    pub docker_timeout_ms: u64,
    pub proxy_timeout_secs: u64,
    pub max_proxy_body_bytes: usize,
    /// If 0, worker IPs are only refreshed on demand.
    pub ip_check_interval_secs: u64,
}

/// Tunnel containers, worker containers and tunnel control URLs are paired by list position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub tunnel_containers: Vec<String>,
    pub worker_containers: Vec<String>,
    pub tunnel_control_urls: Vec<String>,
    pub workers: Vec<WorkerEndpointConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEndpointConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub tunnel_control_url: String,
    pub ytdlp_path: String,
    pub output_dir: String,
    pub tool_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Shared start index advanced once per job.
    Rotation,
    /// Legacy ordering by rolling success rate.
    HealthScored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub strategy: DispatchStrategy,
    pub download_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub output_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            primary_url: default_primary_url(),
            docker_socket: default_docker_socket(),
            self_container: default_self_container(),
            infra_containers: default_infra_containers(),
            soft_restart_delay_ms: default_soft_restart_delay_ms(),
            tunnel_timeout_ms: default_tunnel_timeout_ms(),
            worker_probe_timeout_ms: default_worker_probe_timeout_ms(),
            docker_timeout_ms: default_docker_timeout_ms(),
            proxy_timeout_secs: default_proxy_timeout_secs(),
            max_proxy_body_bytes: default_max_proxy_body_bytes(),
            ip_check_interval_secs: default_ip_check_interval_secs(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: default_worker_id(),
            host: default_worker_host(),
            port: default_worker_port(),
            tunnel_control_url: default_tunnel_control_url(),
            ytdlp_path: default_ytdlp_path(),
            output_dir: default_worker_output_dir(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            strategy: default_dispatch_strategy(),
            download_timeout_secs: default_download_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            output_dir: default_dispatch_output_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    LengthMismatch {
        left: &'static str,
        left_len: usize,
        right: &'static str,
        right_len: usize,
    },
    Duplicate {
        what: &'static str,
        name: String,
    },
    Invalid {
        what: &'static str,
        value: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LengthMismatch {
                left,
                left_len,
                right,
                right_len,
            } => write!(
                f,
                "{left} has {left_len} entries but {right} has {right_len}; paired lists must match"
            ),
            Self::Duplicate { what, name } => write!(f, "duplicate {what} '{name}'"),
            Self::Invalid { what, value } => write!(f, "invalid {what} '{value}'"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Applies the environment-style overrides used by container deployments.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GLUETUN_CONTAINERS") {
            self.fleet.tunnel_containers = split_list(&v);
        }
        if let Some(v) = lookup("WORKER_CONTAINERS") {
            self.fleet.worker_containers = split_list(&v);
        }
        if let Some(v) = lookup("GLUETUN_CONTROL_URLS") {
            self.fleet.tunnel_control_urls = split_list(&v);
        }
        if let Some(v) = lookup("WORKER_URLS") {
            let urls = split_list(&v);
            let ids = lookup("WORKER_IDS").map(|ids| split_list(&ids));
            self.fleet.workers = urls
                .into_iter()
                .enumerate()
                .map(|(i, url)| WorkerEndpointConfig {
                    id: ids
                        .as_ref()
                        .and_then(|ids| ids.get(i).cloned())
                        .unwrap_or_else(|| format!("worker-{}", i + 1)),
                    url,
                })
                .collect();
        }
        if let Some(v) = lookup("INFRA_CONTAINERS") {
            self.gateway.infra_containers = split_list(&v);
        }
        if let Some(port) = lookup("MANAGER_PORT").and_then(|v| v.trim().parse().ok()) {
            self.gateway.port = port;
        }
        if let Some(v) = lookup("PRIMARY_URL") {
            self.gateway.primary_url = v.trim().to_string();
        }
        if let Some(v) = lookup("DOCKER_SOCKET") {
            self.gateway.docker_socket = v.trim().to_string();
        }
        if let Some(v) = lookup("WORKER_ID") {
            self.worker.id = v.trim().to_string();
        }
        if let Some(port) = lookup("WORKER_PORT").and_then(|v| v.trim().parse().ok()) {
            self.worker.port = port;
        }
        if let Some(v) = lookup("GLUETUN_CONTROL_URL") {
            self.worker.tunnel_control_url = v.trim().to_string();
        }
        if let Some(v) = lookup("YTDLP_PATH") {
            self.worker.ytdlp_path = v.trim().to_string();
        }
    }

    /// Relative paths are taken under `general.data_dir`.
    pub fn data_path(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            PathBuf::from(&self.general.data_dir).join(path)
        }
    }

    pub fn dispatcher_output_dir(&self) -> PathBuf {
        self.data_path(&self.dispatcher.output_dir)
    }

    pub fn worker_output_dir(&self) -> PathBuf {
        self.data_path(&self.worker.output_dir)
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel_containers.len() != self.worker_containers.len() {
            return Err(ConfigError::LengthMismatch {
                left: "tunnel_containers",
                left_len: self.tunnel_containers.len(),
                right: "worker_containers",
                right_len: self.worker_containers.len(),
            });
        }
        if self.tunnel_containers.len() != self.tunnel_control_urls.len() {
            return Err(ConfigError::LengthMismatch {
                left: "tunnel_containers",
                left_len: self.tunnel_containers.len(),
                right: "tunnel_control_urls",
                right_len: self.tunnel_control_urls.len(),
            });
        }
        // Workers may be listed without containers (e.g. bare-metal dev), but when both are
        // present they are paired by position.
        if !self.worker_containers.is_empty()
            && !self.workers.is_empty()
            && self.workers.len() != self.worker_containers.len()
        {
            return Err(ConfigError::LengthMismatch {
                left: "workers",
                left_len: self.workers.len(),
                right: "worker_containers",
                right_len: self.worker_containers.len(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for name in self.tunnel_containers.iter().chain(&self.worker_containers) {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    what: "container name",
                    value: name.clone(),
                });
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Duplicate {
                    what: "container",
                    name: name.clone(),
                });
            }
        }

        let mut ids = std::collections::HashSet::new();
        for w in &self.workers {
            if !ids.insert(w.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    what: "worker id",
                    name: w.id.clone(),
                });
            }
            if !(w.url.starts_with("http://") || w.url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    what: "worker url",
                    value: w.url.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn tunnel_index(&self, container: &str) -> Option<usize> {
        self.tunnel_containers.iter().position(|c| c == container)
    }

    /// Worker container sharing the tunnel's network namespace, resolved by list position.
    pub fn paired_worker_container(&self, tunnel_container: &str) -> Option<&str> {
        let idx = self.tunnel_index(tunnel_container)?;
        self.worker_containers.get(idx).map(String::as_str)
    }

    pub fn paired_worker(&self, tunnel_container: &str) -> Option<&WorkerEndpointConfig> {
        let idx = self.tunnel_index(tunnel_container)?;
        self.workers.get(idx)
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerEndpointConfig> {
        self.workers.iter().find(|w| w.id == id)
    }
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG
    // 2) general.log_level from config.toml
    // 3) info
    //
    // Example:
    // RUST_LOG=info,vpn_fleet::dispatch=debug

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| Some(config.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}
