use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::docker::{error::DockerError, logs::demux_log_frames};
use crate::net::{HttpResponse, http_request};

pub type Result<T> = std::result::Result<T, DockerError>;

/// Seconds the daemon waits for a graceful stop before killing during restart.
pub const RESTART_GRACE_SECS: u32 = 10;

#[derive(Debug, Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
    io_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub name: String,
    pub status: String,
    pub running: bool,
    pub restarting: bool,
    pub health: Option<ContainerHealth>,
    pub started_at: Option<String>,
    pub restart_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHealth {
    pub status: String,
    pub failing_streak: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectJson {
    #[serde(default)]
    name: String,
    state: InspectState,
    #[serde(default)]
    restart_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    restarting: bool,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    #[serde(default)]
    status: String,
    #[serde(default)]
    failing_streak: u64,
}

/// Container names as accepted by the daemon: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub(crate) fn parse_inspect(container: &str, body: &[u8]) -> Result<ContainerState> {
    let raw: InspectJson = serde_json::from_slice(body).map_err(|source| DockerError::Decode {
        what: "container inspect",
        source,
    })?;
    let name = raw.name.trim_start_matches('/').to_string();
    Ok(ContainerState {
        name: if name.is_empty() {
            container.to_string()
        } else {
            name
        },
        status: raw.state.status,
        running: raw.state.running,
        restarting: raw.state.restarting,
        health: raw.state.health.map(|h| ContainerHealth {
            status: h.status,
            failing_streak: h.failing_streak,
        }),
        started_at: raw.state.started_at,
        restart_count: raw.restart_count,
    })
}

impl DockerClient {
    pub fn new(socket_path: impl AsRef<Path>, io_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            io_timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn inspect(&self, container: &str) -> Result<ContainerState> {
        let resp = self
            .call("GET", &format!("/containers/{container}/json"), container)
            .await?;
        parse_inspect(container, &resp.body)
    }

    pub async fn restart(&self, container: &str, grace_secs: u32) -> Result<()> {
        tracing::info!(container, grace_secs, "restarting container");
        self.call(
            "POST",
            &format!("/containers/{container}/restart?t={grace_secs}"),
            container,
        )
        .await?;
        Ok(())
    }

    pub async fn stop(&self, container: &str) -> Result<()> {
        tracing::info!(container, "stopping container");
        match self
            .call("POST", &format!("/containers/{container}/stop"), container)
            .await
        {
            Ok(_) => Ok(()),
            // 304: already stopped.
            Err(DockerError::Api { status: 304, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn logs(&self, container: &str, tail: usize) -> Result<Vec<String>> {
        let resp = self
            .call(
                "GET",
                &format!("/containers/{container}/logs?stdout=1&stderr=1&tail={tail}&timestamps=1"),
                container,
            )
            .await?;
        Ok(demux_log_frames(&resp.body))
    }

    async fn call(&self, method: &str, path: &str, container: &str) -> Result<HttpResponse> {
        if !is_valid_container_name(container) {
            return Err(DockerError::InvalidName(container.to_string()));
        }
        let stream = self.connect().await?;
        let resp = http_request(stream, method, "docker", path, None, self.io_timeout).await?;
        if !resp.is_success() {
            return Err(DockerError::Api {
                status: resp.status,
                container: container.to_string(),
                body: resp.body_text(),
            });
        }
        Ok(resp)
    }

    #[cfg(unix)]
    async fn connect(&self) -> Result<tokio::net::UnixStream> {
        let connect = tokio::net::UnixStream::connect(&self.socket_path);
        match tokio::time::timeout(self.io_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(DockerError::Connect {
                socket: self.socket_path.display().to_string(),
                source,
            }),
            Err(_) => Err(DockerError::Connect {
                socket: self.socket_path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.io_timeout),
                ),
            }),
        }
    }

    #[cfg(not(unix))]
    async fn connect(&self) -> Result<tokio::io::DuplexStream> {
        Err(DockerError::Connect {
            socket: self.socket_path.display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "docker unix socket is not available on this platform",
            ),
        })
    }
}
