use futures_util::StreamExt as _;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt as _;

use crate::block_detect::is_block_message;
use crate::dispatch::types::{FailureKind, SliceRequest, WorkerEndpoint};
use crate::tunnel::location_label;

/// What a worker's `/health` says about its tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthProbe {
    pub public_ip: Option<String>,
    pub location: Option<String>,
}

impl HealthProbe {
    pub fn from_health_json(body: &Value) -> Self {
        let vpn = &body["vpn"];
        let public_ip = vpn["public_ip"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let location = location_label(vpn["city"].as_str(), vpn["country"].as_str());
        Self {
            public_ip,
            location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
}

impl DownloadFailure {
    pub fn blocked(&self) -> bool {
        self.kind == FailureKind::Blocked
    }
}

/// How the dispatcher talks to a worker. The HTTP implementation is the only production one;
/// tests substitute scripted transports.
pub trait WorkerTransport: Send + Sync {
    fn probe(
        &self,
        worker: &WorkerEndpoint,
    ) -> impl Future<Output = Result<HealthProbe, String>> + Send;

    /// Writes the audio to `dest` and returns the byte count.
    fn download(
        &self,
        worker: &WorkerEndpoint,
        req: &SliceRequest,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, DownloadFailure>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    vpn_down: bool,
}

/// Classifies a non-2xx worker response.
pub fn classify_worker_error(status: u16, body: &str) -> DownloadFailure {
    let parsed: Option<WorkerErrorBody> = serde_json::from_str(body).ok();
    let detail = parsed
        .as_ref()
        .and_then(|b| b.error.clone())
        .unwrap_or_else(|| body.trim().to_string());
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    };

    // Match phrases against the error text only; JSON bodies carry a literal `blocked` key.
    let blocked = status == 403
        || parsed.as_ref().map(|b| b.blocked).unwrap_or(false)
        || is_block_message(&detail);
    let vpn_down = parsed.as_ref().map(|b| b.vpn_down).unwrap_or(false);

    let kind = if blocked {
        FailureKind::Blocked
    } else if vpn_down {
        FailureKind::TunnelDown
    } else {
        FailureKind::Failed
    };
    DownloadFailure {
        kind,
        status: Some(status),
        message,
    }
}

#[derive(Debug, Clone)]
pub struct HttpWorkerTransport {
    http: reqwest::Client,
    health_timeout: Duration,
    download_timeout: Duration,
}

impl HttpWorkerTransport {
    pub fn new(http: reqwest::Client, health_timeout: Duration, download_timeout: Duration) -> Self {
        Self {
            http,
            health_timeout,
            download_timeout,
        }
    }

    fn request_failure(err: reqwest::Error) -> DownloadFailure {
        if err.is_timeout() {
            DownloadFailure {
                kind: FailureKind::Timeout,
                status: None,
                message: "download timed out".to_string(),
            }
        } else {
            DownloadFailure {
                kind: FailureKind::Unreachable,
                status: None,
                message: format!("worker unreachable: {err}"),
            }
        }
    }

    async fn stream_to_file(
        resp: reqwest::Response,
        dest: &Path,
    ) -> Result<u64, DownloadFailure> {
        let io_failure = |what: &str, err: std::io::Error| DownloadFailure {
            kind: FailureKind::Failed,
            status: None,
            message: format!("failed to {what} {}: {err}", dest.display()),
        };
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| io_failure("create", e))?;
        let mut written = 0u64;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(Self::request_failure)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| io_failure("write", e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| io_failure("flush", e))?;
        if written == 0 {
            return Err(DownloadFailure {
                kind: FailureKind::Failed,
                status: None,
                message: "worker returned an empty audio body".to_string(),
            });
        }
        Ok(written)
    }
}

impl WorkerTransport for HttpWorkerTransport {
    async fn probe(&self, worker: &WorkerEndpoint) -> Result<HealthProbe, String> {
        let url = format!("{}/health", worker.base_url());
        let resp = self
            .http
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "health check timed out".to_string()
                } else {
                    format!("health check failed: {e}")
                }
            })?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| format!("health check returned invalid JSON: {e}"))?;
        if !status.is_success() {
            return Err(format!("health check returned {}", status.as_u16()));
        }
        Ok(HealthProbe::from_health_json(&body))
    }

    async fn download(
        &self,
        worker: &WorkerEndpoint,
        req: &SliceRequest,
        dest: &Path,
    ) -> Result<u64, DownloadFailure> {
        let url = format!("{}/download", worker.base_url());
        let resp = self
            .http
            .post(&url)
            .timeout(self.download_timeout)
            .json(req)
            .send()
            .await
            .map_err(Self::request_failure)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_worker_error(status.as_u16(), &body));
        }
        Self::stream_to_file(resp, dest).await
    }
}
