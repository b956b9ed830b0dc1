use crate::dispatch::types::VpnAttempt;

#[derive(Debug)]
pub enum DispatchError {
    NoWorkers,
    InvalidRequest(String),
    OutputDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// Every configured worker was tried once and none produced audio.
    AllWorkersFailed { attempts: Vec<VpnAttempt> },
}

impl DispatchError {
    pub fn attempts(&self) -> &[VpnAttempt] {
        match self {
            Self::AllWorkersFailed { attempts } => attempts,
            _ => &[],
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoWorkers => write!(f, "no VPN workers configured"),
            Self::InvalidRequest(msg) => write!(f, "invalid download request: {msg}"),
            Self::OutputDir { path, source } => {
                write!(
                    f,
                    "failed to prepare output directory '{}': {source}",
                    path.display()
                )
            }
            Self::AllWorkersFailed { attempts } => {
                write!(f, "all {} VPN workers failed:", attempts.len())?;
                for a in attempts {
                    write!(
                        f,
                        " [{}] {}",
                        a.proxy,
                        a.error.as_deref().unwrap_or("unknown error")
                    )?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::OutputDir { source, .. } => Some(source),
            _ => None,
        }
    }
}
