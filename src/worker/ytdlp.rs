use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;

use crate::block_detect::is_block_message;
use crate::config::WorkerConfig;
use crate::logging::{redact_url, tail_chars};
use crate::worker::timecode::section_arg;

const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug)]
pub enum ToolError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Timeout {
        after: Duration,
    },
    Failed {
        code: Option<i32>,
        stderr: String,
    },
    MissingOutput {
        path: PathBuf,
    },
}

impl ToolError {
    /// Whether the failure looks like the source refusing this exit IP.
    pub fn is_block(&self) -> bool {
        match self {
            Self::Failed { stderr, .. } => is_block_message(stderr),
            _ => false,
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { program, source } => write!(f, "failed to start {program}: {source}"),
            Self::Timeout { after } => {
                write!(f, "yt-dlp timed out after {}s", after.as_secs())
            }
            Self::Failed { code, stderr } => match code {
                Some(code) => write!(f, "yt-dlp exited with {code}: {}", stderr.trim()),
                None => write!(f, "yt-dlp was terminated: {}", stderr.trim()),
            },
            Self::MissingOutput { path } => {
                write!(f, "yt-dlp finished but {} was not written", path.display())
            }
        }
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Every clip in the fleet is MP3.
pub const AUDIO_FORMAT: &str = "mp3";
pub const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

/// Runs yt-dlp to cut one audio section to disk.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
    output_dir: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(program: impl Into<String>, output_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            output_dir: output_dir.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self::new(
            &cfg.ytdlp_path,
            &cfg.output_dir,
            Duration::from_secs(cfg.tool_timeout_secs.max(1)),
        )
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn args(&self, video_url: &str, start_ms: u64, end_ms: u64, template: &Path) -> Vec<String> {
        vec![
            "-x".to_string(),
            "--audio-format".to_string(),
            AUDIO_FORMAT.to_string(),
            "--download-sections".to_string(),
            section_arg(start_ms, end_ms),
            "--force-keyframes-at-cuts".to_string(),
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "-o".to_string(),
            template.display().to_string(),
            video_url.to_string(),
        ]
    }

    /// Returns the path of the finished audio file. The caller owns it.
    pub async fn extract(
        &self,
        video_url: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<PathBuf, ToolError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stem = unique_stem(start_ms, end_ms);
        let template = self.output_dir.join(format!("{stem}.%(ext)s"));
        let expected = self.output_dir.join(format!("{stem}.{AUDIO_FORMAT}"));

        tracing::info!(
            url = %redact_url(video_url),
            start_ms,
            end_ms,
            "running yt-dlp"
        );
        let child = Command::new(&self.program)
            .args(self.args(video_url, start_ms, end_ms, &template))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the output future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ToolError::Spawn {
                    program: self.program.clone(),
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(after_secs = self.timeout.as_secs(), "yt-dlp timed out; killed");
                remove_quietly(&expected).await;
                return Err(ToolError::Timeout {
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            remove_quietly(&expected).await;
            return Err(ToolError::Failed {
                code: output.status.code(),
                stderr: tail_chars(stderr.trim(), STDERR_TAIL_CHARS),
            });
        }
        if tokio::fs::metadata(&expected).await.is_err() {
            return Err(ToolError::MissingOutput { path: expected });
        }
        Ok(expected)
    }
}

fn unique_stem(start_ms: u64, end_ms: u64) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("clip_{start_ms}_{end_ms}_{nanos}_{seq}")
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %err, "failed to remove tool output");
    }
}
