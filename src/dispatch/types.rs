use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::WorkerEndpointConfig;

/// A worker reachable over HTTP. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerEndpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(skip)]
    scheme: String,
}

impl WorkerEndpoint {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            scheme: "http".to_string(),
        }
    }

    pub fn from_config(cfg: &WorkerEndpointConfig) -> Result<Self, String> {
        let url = reqwest::Url::parse(&cfg.url).map_err(|e| format!("{}: {e}", cfg.url))?;
        let host = url
            .host_str()
            .ok_or_else(|| format!("{}: missing host", cfg.url))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| format!("{}: missing port", cfg.url))?;
        Ok(Self {
            id: cfg.id.clone(),
            host,
            port,
            scheme: url.scheme().to_string(),
        })
    }

    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceRequest {
    pub video_url: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl SliceRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.video_url.trim().is_empty() {
            return Err("videoUrl is required".to_string());
        }
        if self.end_ms <= self.start_ms {
            return Err(format!(
                "endMs ({}) must be greater than startMs ({})",
                self.end_ms, self.start_ms
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Pre-flight found no public IP; the download was never attempted.
    TunnelDown,
    /// The source refused the request.
    Blocked,
    Timeout,
    Unreachable,
    Failed,
}

/// One worker tried for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnAttempt {
    pub proxy: String,
    pub ip: Option<String>,
    pub location: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// 1-based position within the job.
    pub attempt_number: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub bytes: u64,
    pub vpn_attempts: Vec<VpnAttempt>,
    pub total_attempts: usize,
    pub successful_proxy: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_from_config_url() {
        let ep = WorkerEndpoint::from_config(&WorkerEndpointConfig {
            id: "worker-2".to_string(),
            url: "http://vpn-worker-2:3001".to_string(),
        })
        .unwrap();
        assert_eq!(ep.host, "vpn-worker-2");
        assert_eq!(ep.port, 3001);
        assert_eq!(ep.base_url(), "http://vpn-worker-2:3001");
    }

    #[test]
    fn endpoint_defaults_port_from_scheme() {
        let ep = WorkerEndpoint::from_config(&WorkerEndpointConfig {
            id: "w".to_string(),
            url: "https://worker.example".to_string(),
        })
        .unwrap();
        assert_eq!(ep.port, 443);
        assert_eq!(ep.base_url(), "https://worker.example:443");
    }

    #[test]
    fn slice_request_requires_positive_range() {
        let mut req = SliceRequest {
            video_url: "https://youtu.be/x".to_string(),
            start_ms: 5000,
            end_ms: 5000,
        };
        assert!(req.validate().is_err());
        req.end_ms = 9000;
        assert!(req.validate().is_ok());
        req.video_url = " ".to_string();
        assert!(req.validate().is_err());
    }
}
