use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{OriginalUri, Request, State},
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;

use crate::gateway::{GatewayState, error::Proxied};
use crate::logging::warn_throttled;

/// Connection-scoped headers (RFC 9110 §7.6.1) that must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName, connection_listed: &[String]) -> bool {
    HOP_BY_HOP.contains(&name.as_str()) || connection_listed.iter().any(|c| c == name.as_str())
}

/// Copies end-to-end headers. Also drops anything named in the `Connection` header.
pub(crate) fn filter_headers(src: &HeaderMap, drop_host: bool) -> HeaderMap {
    let connection_listed: Vec<String> = src
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if is_hop_by_hop(name, &connection_listed) {
            continue;
        }
        if drop_host && (name == header::HOST || name == header::CONTENT_LENGTH) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[derive(Debug, Serialize)]
struct BadGatewayBody {
    error: &'static str,
    message: String,
    hint: String,
}

fn bad_gateway(primary: &str, message: String) -> Response {
    let mut resp = (
        StatusCode::BAD_GATEWAY,
        Json(BadGatewayBody {
            error: "Bad gateway",
            message,
            hint: format!("primary application server at {primary} is unreachable or not ready"),
        }),
    )
        .into_response();
    resp.extensions_mut().insert(Proxied);
    resp
}

/// Fallback for every request no control-plane route claims, including a known path hit
/// with a method it does not serve. Nested routers see a prefix-stripped URI, so the
/// target is built from the original one.
pub(crate) async fn proxy(
    State(state): State<GatewayState>,
    OriginalUri(original): OriginalUri,
    req: Request,
) -> Response {
    let primary = state.config.gateway.primary_url.trim_end_matches('/');
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("{primary}{path_and_query}");

    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, state.config.gateway.max_proxy_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!(error = %err, "rejecting proxied request body");
            let mut resp = StatusCode::PAYLOAD_TOO_LARGE.into_response();
            resp.extensions_mut().insert(Proxied);
            return resp;
        }
    };

    let upstream = state
        .proxy_http
        .request(parts.method.clone(), &target)
        .headers(filter_headers(&parts.headers, true))
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(resp) => resp,
        Err(err) => {
            if warn_throttled("gateway_proxy_upstream_failed", Duration::from_secs(10)) {
                tracing::warn!(
                    method = %parts.method,
                    target = %target,
                    error = %err,
                    "proxy request to primary server failed"
                );
            }
            return bad_gateway(primary, err.to_string());
        }
    };

    let status = upstream.status();
    let headers = filter_headers(upstream.headers(), false);
    let mut resp = Response::new(Body::from_stream(upstream.bytes_stream()));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp.extensions_mut().insert(Proxied);
    resp
}
