//! Minimal HTTP/1.1 client over an arbitrary byte stream.
//!
//! The container-control API is only reachable through a Unix socket, which `reqwest` cannot
//! dial. Requests are sent with `Connection: close` and the response is read to EOF.

use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, timeout};

pub type Result<T> = std::result::Result<T, HttpError>;

#[derive(Debug)]
pub enum HttpError {
    Timeout { op: &'static str, dur: Duration },
    Io { op: &'static str, source: std::io::Error },
    Malformed { what: String },
}

impl HttpError {
    fn malformed(what: impl Into<String>) -> Self {
        Self::Malformed { what: what.into() }
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { op, dur } => write!(f, "HTTP {op} timed out after {dur:?}"),
            Self::Io { op, source } => write!(f, "HTTP {op} I/O error: {source}"),
            Self::Malformed { what } => write!(f, "malformed HTTP response: {what}"),
        }
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn http_request(
    mut stream: impl AsyncRead + AsyncWrite + Unpin,
    method: &str,
    host: &str,
    path: &str,
    body: Option<&[u8]>,
    io_timeout: Duration,
) -> Result<HttpResponse> {
    let path = if path.is_empty() { "/" } else { path };
    let mut req = format!(
        "{method} {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: vpn-fleet/0.1\r\nConnection: close\r\nAccept: */*\r\n"
    );
    match body {
        Some(body) => {
            req.push_str("Content-Type: application/json\r\n");
            req.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        }
        None if method != "GET" => req.push_str("Content-Length: 0\r\n\r\n"),
        None => req.push_str("\r\n"),
    }

    let mut out = req.into_bytes();
    if let Some(body) = body {
        out.extend_from_slice(body);
    }

    timeout(io_timeout, stream.write_all(&out))
        .await
        .map_err(|_| HttpError::Timeout {
            op: "write",
            dur: io_timeout,
        })?
        .map_err(|source| HttpError::Io { op: "write", source })?;

    timeout(io_timeout, stream.flush())
        .await
        .map_err(|_| HttpError::Timeout {
            op: "flush",
            dur: io_timeout,
        })?
        .map_err(|source| HttpError::Io { op: "flush", source })?;

    let mut buf = Vec::new();
    timeout(io_timeout, stream.read_to_end(&mut buf))
        .await
        .map_err(|_| HttpError::Timeout {
            op: "read",
            dur: io_timeout,
        })?
        .map_err(|source| HttpError::Io { op: "read", source })?;

    parse_http_response(&buf)
}

fn parse_http_response(raw: &[u8]) -> Result<HttpResponse> {
    let (head, body) = split_http(raw)?;
    let head_str = std::str::from_utf8(head)
        .map_err(|_| HttpError::malformed("headers were not valid UTF-8"))?;
    let mut lines = head_str.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| HttpError::malformed("missing status line"))?;
    let mut parts = status_line.split_whitespace();
    let _http = parts
        .next()
        .ok_or_else(|| HttpError::malformed(format!("bad status line: {status_line}")))?;
    let status: u16 = parts
        .next()
        .ok_or_else(|| HttpError::malformed(format!("bad status line: {status_line}")))?
        .parse()
        .map_err(|_| HttpError::malformed(format!("bad status code in: {status_line}")))?;

    let mut headers = HashMap::<String, String>::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| HttpError::malformed(format!("bad header line: {line}")))?;
        headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
    }

    let body = if headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase())
        .as_deref()
        == Some("chunked")
    {
        decode_chunked(body)?
    } else {
        body.to_vec()
    };

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn split_http(raw: &[u8]) -> Result<(&[u8], &[u8])> {
    if let Some(i) = find(raw, b"\r\n\r\n") {
        return Ok((&raw[..i], &raw[i + 4..]));
    }
    if let Some(i) = find(raw, b"\n\n") {
        return Ok((&raw[..i], &raw[i + 2..]));
    }
    Err(HttpError::malformed("missing header delimiter"))
}

fn decode_chunked(mut b: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = find(b, b"\r\n")
            .ok_or_else(|| HttpError::malformed("chunked encoding: missing CRLF after size"))?;
        let line = std::str::from_utf8(&b[..line_end])
            .map_err(|_| HttpError::malformed("chunk size line was not UTF-8"))?;
        let size_str = line.split(';').next().unwrap_or(line).trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| HttpError::malformed(format!("bad chunk size: {size_str}")))?;
        b = &b[line_end + 2..];
        if size == 0 {
            break;
        }
        if b.len() < size {
            // Connection closed mid-chunk; keep what arrived.
            out.extend_from_slice(b);
            break;
        }
        out.extend_from_slice(&b[..size]);
        b = b.get(size + 2..).unwrap_or(&[]);
    }
    Ok(out)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_http_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let r = parse_http_response(raw).unwrap();
        assert_eq!(r.status, 200);
        assert_eq!(r.body, b"hello");
        assert_eq!(r.headers.get("content-length").unwrap(), "5");
    }

    #[test]
    fn parses_chunked_http_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let r = parse_http_response(raw).unwrap();
        assert_eq!(r.status, 200);
        assert_eq!(r.body, b"hello world");
    }

    #[test]
    fn rejects_missing_status_code() {
        let raw = b"HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_http_response(raw),
            Err(HttpError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn request_round_trip_over_duplex() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            server.shutdown().await.unwrap();
            req
        });

        let resp = http_request(
            client,
            "POST",
            "docker",
            "/containers/gluetun-1/restart?t=10",
            None,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.is_success());

        let req = server_task.await.unwrap();
        assert!(req.starts_with("POST /containers/gluetun-1/restart?t=10 HTTP/1.1\r\n"));
        assert!(req.contains("Content-Length: 0\r\n"));
    }
}
