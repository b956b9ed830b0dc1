use axum::{
    Json,
    body::Body,
    body::Bytes,
    extract::Request,
    http::StatusCode,
    http::header::{CONTENT_LENGTH, CONTENT_TYPE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::docker::DockerError;
use crate::tunnel::TunnelError;

/// Failures of a control-plane call, reported synchronously to the operator. Never retried.
#[derive(Debug)]
pub enum ControlError {
    /// Not in the configured allowlist; rejected before touching the socket.
    UnknownContainer(String),
    UnknownWorker(String),
    BadRequest(String),
    Docker(DockerError),
    Tunnel {
        container: String,
        source: TunnelError,
    },
    Worker {
        worker: String,
        status: Option<u16>,
        message: String,
    },
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownContainer(_)
            | Self::UnknownWorker(_)
            | Self::BadRequest(_)
            | Self::Docker(DockerError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            Self::Docker(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Tunnel { source, .. } if source.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Docker(_) | Self::Tunnel { .. } | Self::Worker { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Docker(err) => err.upstream_status(),
            Self::Tunnel {
                source: TunnelError::Status { status, .. },
                ..
            } => Some(*status),
            Self::Worker { status, .. } => *status,
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownContainer(name) => write!(f, "unknown container '{name}'"),
            Self::UnknownWorker(id) => write!(f, "unknown worker '{id}'"),
            Self::BadRequest(msg) => write!(f, "{msg}"),
            Self::Docker(err) => write!(f, "{err}"),
            Self::Tunnel { container, source } => write!(f, "{container}: {source}"),
            Self::Worker {
                worker, message, ..
            } => write!(f, "{worker}: {message}"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Docker(err) => Some(err),
            Self::Tunnel { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<DockerError> for ControlError {
    fn from(value: DockerError) -> Self {
        Self::Docker(value)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    upstream_status: Option<u16>,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, status = status.as_u16(), "control-plane call failed");
        }
        (
            status,
            Json(ControlErrorBody {
                success: false,
                error: self.to_string(),
                upstream_status: self.upstream_status(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct ApiErrorEnvelope {
    pub(crate) code: u16,
    pub(crate) message: String,
}

pub(crate) fn message_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad request",
        StatusCode::NOT_FOUND => "not found",
        StatusCode::METHOD_NOT_ALLOWED => "method not allowed",
        StatusCode::PAYLOAD_TOO_LARGE => "request body too large",
        StatusCode::UNSUPPORTED_MEDIA_TYPE => "unsupported media type",
        StatusCode::UNPROCESSABLE_ENTITY => "unprocessable entity",
        StatusCode::BAD_GATEWAY => "bad gateway",
        StatusCode::SERVICE_UNAVAILABLE => "service unavailable",
        StatusCode::GATEWAY_TIMEOUT => "gateway timeout",
        StatusCode::INTERNAL_SERVER_ERROR => "internal server error",
        _ => "request failed",
    }
}

pub(crate) fn status_with_message(status: StatusCode) -> (StatusCode, Json<ApiErrorEnvelope>) {
    (
        status,
        Json(ApiErrorEnvelope {
            code: status.as_u16(),
            message: message_for_status(status).to_string(),
        }),
    )
}

pub(crate) fn parse_json_with_limit<T: serde::de::DeserializeOwned>(
    bytes: Bytes,
    max_bytes: usize,
) -> ControlResult<T> {
    if bytes.len() > max_bytes {
        return Err(ControlError::BadRequest(format!(
            "request body exceeds {max_bytes} bytes"
        )));
    }
    serde_json::from_slice::<T>(&bytes)
        .map_err(|e| ControlError::BadRequest(format!("invalid JSON body: {e}")))
}

/// Response extension set on everything the reverse proxy returns.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Proxied;

/// Rewrites non-JSON error responses on control-plane routes into `{code, message}`.
/// Proxied responses are never touched.
pub(crate) async fn error_envelope_mw(req: Request<Body>, next: Next) -> Response {
    let is_control = req.uri().path().starts_with("/manager/");
    let resp = next.run(req).await;
    if !is_control {
        return resp;
    }
    if resp.status().is_success() || resp.extensions().get::<Proxied>().is_some() {
        return resp;
    }
    let has_json_body = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if has_json_body {
        return resp;
    }

    let status = resp.status();
    let envelope_resp = status_with_message(status).into_response();
    let (mut orig_parts, _orig_body) = resp.into_parts();
    orig_parts.headers.remove(CONTENT_LENGTH);
    let (envelope_parts, envelope_body) = envelope_resp.into_parts();
    orig_parts.headers.extend(envelope_parts.headers);
    Response::from_parts(orig_parts, envelope_body)
}
