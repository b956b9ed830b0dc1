use axum::Json;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
    pub(crate) service: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "manager",
    })
}

/// The gateway's own process, attached to its entry in the infrastructure status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProcessStats {
    pub(crate) pid: u32,
    pub(crate) uptime_secs: u64,
    pub(crate) rss_kb: Option<u64>,
    pub(crate) peak_rss_kb: Option<u64>,
    pub(crate) threads: Option<u64>,
}

impl ProcessStats {
    pub(crate) async fn collect(started_at: Instant) -> Self {
        let mut stats = Self {
            pid: std::process::id(),
            uptime_secs: started_at.elapsed().as_secs(),
            rss_kb: None,
            peak_rss_kb: None,
            threads: None,
        };
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = tokio::fs::read_to_string("/proc/self/status").await {
                stats.apply_proc_status(&status);
            }
        }
        stats
    }

    fn apply_proc_status(&mut self, status: &str) {
        for line in status.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let value = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok());
            match key {
                "VmRSS" => self.rss_kb = value,
                "VmHWM" => self.peak_rss_kb = value,
                "Threads" => self.threads = value,
                _ => {}
            }
        }
    }
}
