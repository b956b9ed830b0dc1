//! Client for a tunnel container's local control API (`/v1/...`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Debug)]
pub enum TunnelError {
    Request {
        url: String,
        source: reqwest::Error,
    },
    Status {
        url: String,
        status: u16,
        body: String,
    },
    /// The control API answered but reported no public IP (tunnel not connected).
    NoPublicIp,
}

impl TunnelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request { source, .. } if source.is_timeout())
    }
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request { url, source } if source.is_timeout() => {
                write!(f, "tunnel control request to {url} timed out")
            }
            Self::Request { url, source } => {
                write!(f, "tunnel control request to {url} failed: {source}")
            }
            Self::Status { url, status, body } => {
                write!(f, "tunnel control {url} returned {status}: {}", body.trim())
            }
            Self::NoPublicIp => write!(f, "tunnel reported no public IP"),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelRunState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIpInfo {
    #[serde(default)]
    pub public_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl PublicIpInfo {
    /// "City, Country" when known; used as the location label in metrics.
    pub fn location(&self) -> Option<String> {
        location_label(self.city.as_deref(), self.country.as_deref())
    }
}

pub fn location_label(city: Option<&str>, country: Option<&str>) -> Option<String> {
    let city = city.map(str::trim).filter(|s| !s.is_empty());
    let country = country.map(str::trim).filter(|s| !s.is_empty());
    match (city, country) {
        (Some(city), Some(country)) => Some(format!("{city}, {country}")),
        (None, Some(country)) => Some(country.to_string()),
        (Some(city), None) => Some(city.to_string()),
        (None, None) => None,
    }
}

#[derive(Debug, Clone)]
pub struct TunnelControl {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl TunnelControl {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /v1/vpn/status`, returned verbatim (e.g. `{"status": "running"}`).
    pub async fn vpn_status(&self) -> Result<Value> {
        self.get_json("/v1/vpn/status").await
    }

    /// `GET /v1/publicip/ip`. Returns the parsed info plus the raw body for passthrough.
    pub async fn public_ip(&self) -> Result<(PublicIpInfo, Value)> {
        let raw = self.get_json("/v1/publicip/ip").await?;
        let info: PublicIpInfo =
            serde_json::from_value(raw.clone()).unwrap_or_else(|_| PublicIpInfo {
                public_ip: String::new(),
                country: None,
                region: None,
                city: None,
                organization: None,
            });
        Ok((info, raw))
    }

    /// Like [`public_ip`](Self::public_ip) but treats an empty IP as a tunnel-down error.
    pub async fn require_public_ip(&self) -> Result<PublicIpInfo> {
        let (info, _) = self.public_ip().await?;
        if info.public_ip.trim().is_empty() {
            return Err(TunnelError::NoPublicIp);
        }
        Ok(info)
    }

    /// `PUT /v1/openvpn/status {"status": "running"|"stopped"}`.
    pub async fn set_openvpn_status(&self, state: TunnelRunState) -> Result<Value> {
        let url = format!("{}/v1/openvpn/status", self.base_url);
        let resp = self
            .http
            .put(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "status": state }))
            .send()
            .await
            .map_err(|source| TunnelError::Request {
                url: url.clone(),
                source,
            })?;
        Self::read_json(url, resp).await
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| TunnelError::Request {
                url: url.clone(),
                source,
            })?;
        Self::read_json(url, resp).await
    }

    async fn read_json(url: String, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|source| TunnelError::Request {
                url: url.clone(),
                source,
            })?;
        if !status.is_success() {
            return Err(TunnelError::Status {
                url,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::get};

    async fn spawn_control(public_ip: &'static str) -> String {
        let app = Router::new()
            .route(
                "/v1/publicip/ip",
                get(move || async move {
                    Json(serde_json::json!({
                        "public_ip": public_ip,
                        "country": "Netherlands",
                        "city": "Amsterdam",
                    }))
                }),
            )
            .route(
                "/v1/vpn/status",
                get(|| async { Json(serde_json::json!({"status": "running"})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn location_label_combinations() {
        assert_eq!(
            location_label(Some("Zurich"), Some("Switzerland")).as_deref(),
            Some("Zurich, Switzerland")
        );
        assert_eq!(location_label(None, Some("Japan")).as_deref(), Some("Japan"));
        assert_eq!(location_label(Some(" "), None), None);
    }

    #[tokio::test]
    async fn reads_public_ip_and_status() {
        let base = spawn_control("203.0.113.7").await;
        let ctl = TunnelControl::new(base, reqwest::Client::new(), Duration::from_secs(3));

        let info = ctl.require_public_ip().await.unwrap();
        assert_eq!(info.public_ip, "203.0.113.7");
        assert_eq!(info.location().as_deref(), Some("Amsterdam, Netherlands"));

        let status = ctl.vpn_status().await.unwrap();
        assert_eq!(status["status"], "running");
    }

    #[tokio::test]
    async fn empty_ip_means_tunnel_down() {
        let base = spawn_control("").await;
        let ctl = TunnelControl::new(base, reqwest::Client::new(), Duration::from_secs(3));
        assert!(matches!(
            ctl.require_public_ip().await,
            Err(TunnelError::NoPublicIp)
        ));
    }

    #[tokio::test]
    async fn unreachable_control_api_is_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let ctl = TunnelControl::new(
            format!("http://127.0.0.1:{port}"),
            reqwest::Client::new(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            ctl.public_ip().await,
            Err(TunnelError::Request { .. })
        ));
    }
}
