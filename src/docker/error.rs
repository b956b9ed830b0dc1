use std::fmt;

use crate::net::HttpError;

#[derive(Debug)]
pub enum DockerError {
    /// Rejected locally; never sent to the daemon.
    InvalidName(String),
    /// Could not reach the control socket at all.
    Connect {
        socket: String,
        source: std::io::Error,
    },
    Http(HttpError),
    /// The daemon answered with a non-success status.
    Api {
        status: u16,
        container: String,
        body: String,
    },
    Decode {
        what: &'static str,
        source: serde_json::Error,
    },
}

impl DockerError {
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(HttpError::Timeout { .. }))
    }
}

impl fmt::Display for DockerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid container name '{name}'"),
            Self::Connect { socket, source } => {
                write!(f, "failed to connect to docker socket {socket}: {source}")
            }
            Self::Http(source) => write!(f, "docker request failed: {source}"),
            Self::Api {
                status,
                container,
                body,
            } => write!(
                f,
                "docker API returned {status} for {container}: {}",
                body.trim()
            ),
            Self::Decode { what, source } => write!(f, "failed to decode docker {what}: {source}"),
        }
    }
}

impl std::error::Error for DockerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } => Some(source),
            Self::Http(source) => Some(source),
            Self::Decode { source, .. } => Some(source),
            Self::Api { .. } | Self::InvalidName(_) => None,
        }
    }
}

impl From<HttpError> for DockerError {
    fn from(value: HttpError) -> Self {
        Self::Http(value)
    }
}
