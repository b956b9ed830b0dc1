use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::dispatch::{DispatchError, DownloadResult, VpnAttempt};
use crate::gateway::{
    GatewayState,
    error::{ControlError, parse_json_with_limit},
};
use crate::worker::AUDIO_CONTENT_TYPE;

const MAX_DOWNLOAD_BODY: usize = 8 * 1024;

pub(crate) const X_SUCCESSFUL_PROXY: HeaderName = HeaderName::from_static("x-successful-proxy");
pub(crate) const X_TOTAL_ATTEMPTS: HeaderName = HeaderName::from_static("x-total-attempts");
pub(crate) const X_VPN_ATTEMPTS: HeaderName = HeaderName::from_static("x-vpn-attempts");

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateDownloadRequestBody {
    pub(crate) video_url: String,
    pub(crate) start_ms: u64,
    pub(crate) end_ms: u64,
    #[serde(default)]
    pub(crate) task_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DownloadFailedResponse {
    pub(crate) success: bool,
    pub(crate) error: String,
    pub(crate) vpn_attempts: Vec<VpnAttempt>,
    pub(crate) total_attempts: usize,
}

/// Runs one job through the dispatcher. Synchronous: the response arrives once a worker
/// succeeded or every worker was tried. A finished clip is streamed back and unlinked.
pub(crate) async fn downloads_create(State(state): State<GatewayState>, body: Bytes) -> Response {
    let req: CreateDownloadRequestBody = match parse_json_with_limit(body, MAX_DOWNLOAD_BODY) {
        Ok(req) => req,
        Err(err) => return err.into_response(),
    };

    let result = state
        .dispatcher()
        .download_audio(&req.video_url, req.start_ms, req.end_ms, req.task_id.as_deref())
        .await;

    match result {
        Ok(result) => stream_clip(result).await,
        Err(DispatchError::InvalidRequest(msg)) => ControlError::BadRequest(msg).into_response(),
        Err(err @ DispatchError::AllWorkersFailed { .. }) => {
            let vpn_attempts = err.attempts().to_vec();
            (
                StatusCode::BAD_GATEWAY,
                Json(DownloadFailedResponse {
                    success: false,
                    error: err.to_string(),
                    total_attempts: vpn_attempts.len(),
                    vpn_attempts,
                }),
            )
                .into_response()
        }
        Err(err @ DispatchError::NoWorkers) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(DownloadFailedResponse {
                success: false,
                error: err.to_string(),
                vpn_attempts: Vec::new(),
                total_attempts: 0,
            }),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "download dispatch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(DownloadFailedResponse {
                    success: false,
                    error: err.to_string(),
                    vpn_attempts: Vec::new(),
                    total_attempts: 0,
                }),
            )
                .into_response()
        }
    }
}

/// JSON with non-ASCII escaped so it is a valid header value.
fn header_json<T: Serialize>(value: &T) -> Option<HeaderValue> {
    use std::fmt::Write as _;
    let raw = serde_json::to_string(value).ok()?;
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(&mut out, "\\u{unit:04x}");
            }
        }
    }
    HeaderValue::from_str(&out).ok()
}

async fn stream_clip(result: DownloadResult) -> Response {
    let path = &result.file_path;
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "finished clip vanished");
            let total_attempts = result.total_attempts;
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(DownloadFailedResponse {
                    success: false,
                    error: format!("failed to open {}: {err}", path.display()),
                    vpn_attempts: result.vpn_attempts,
                    total_attempts,
                }),
            )
                .into_response();
        }
    };
    let len = file.metadata().await.map(|m| m.len()).unwrap_or(result.bytes);
    if let Err(err) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %err, "failed to unlink delivered clip");
    }

    let mut resp = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(AUDIO_CONTENT_TYPE));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(X_TOTAL_ATTEMPTS, HeaderValue::from(result.total_attempts));
    if let Some(v) = result
        .successful_proxy
        .as_deref()
        .and_then(|w| HeaderValue::from_str(w).ok())
    {
        headers.insert(X_SUCCESSFUL_PROXY, v);
    }
    if let Some(v) = header_json(&result.vpn_attempts) {
        headers.insert(X_VPN_ATTEMPTS, v);
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_json_escapes_non_ascii() {
        let v = header_json(&json!({ "location": "Zürich, Schweiz" })).unwrap();
        let text = v.to_str().unwrap();
        assert_eq!(text, r#"{"location":"Z\u00fcrich, Schweiz"}"#);
        let back: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(back["location"], "Zürich, Schweiz");
    }
}
