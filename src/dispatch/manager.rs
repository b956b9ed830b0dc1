use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::dispatch::errors::DispatchError;
use crate::dispatch::stats::{WorkerStatsStore, job};
use crate::dispatch::transport::WorkerTransport;
use crate::dispatch::types::{DownloadResult, FailureKind, SliceRequest, VpnAttempt, WorkerEndpoint};
use crate::logging::redact_url;
use crate::metrics::{MetricsTracker, RequestOutcome};
use crate::pool::HealthScoredPool;

pub type Result<T> = std::result::Result<T, DispatchError>;

pub const TUNNEL_DOWN_SKIP: &str = "VPN is down, skipping";

/// How candidates are ordered for one job. Either way each worker is tried at most once.
pub enum CandidateOrder {
    /// Shared start index, advanced once per job.
    Rotation,
    HealthScored(Arc<HealthScoredPool>),
}

/// Sequences one download across the worker fleet until a worker succeeds.
pub struct VpnDownloadManager<T: WorkerTransport> {
    workers: Vec<WorkerEndpoint>,
    transport: T,
    stats: Arc<WorkerStatsStore>,
    metrics: Arc<MetricsTracker>,
    order: CandidateOrder,
    next_start: AtomicUsize,
    output_dir: PathBuf,
}

impl<T: WorkerTransport> VpnDownloadManager<T> {
    pub fn new(
        workers: Vec<WorkerEndpoint>,
        transport: T,
        metrics: Arc<MetricsTracker>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let stats = Arc::new(WorkerStatsStore::new(workers.iter().map(|w| w.id.clone())));
        Self {
            workers,
            transport,
            stats,
            metrics,
            order: CandidateOrder::Rotation,
            next_start: AtomicUsize::new(0),
            output_dir: output_dir.into(),
        }
    }

    pub fn with_order(mut self, order: CandidateOrder) -> Self {
        self.order = order;
        self
    }

    pub fn workers(&self) -> &[WorkerEndpoint] {
        &self.workers
    }

    pub fn stats(&self) -> &Arc<WorkerStatsStore> {
        &self.stats
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    pub fn pool(&self) -> Option<&Arc<HealthScoredPool>> {
        match &self.order {
            CandidateOrder::HealthScored(pool) => Some(pool),
            CandidateOrder::Rotation => None,
        }
    }

    /// Index the next rotation job will start at.
    pub fn rotation_index(&self) -> usize {
        match self.workers.len() {
            0 => 0,
            n => self.next_start.load(Ordering::SeqCst) % n,
        }
    }

    /// Worker indexes to try for the next job.
    fn candidate_order(&self) -> Vec<usize> {
        let n = self.workers.len();
        match &self.order {
            CandidateOrder::Rotation => {
                let start = self.next_start.fetch_add(1, Ordering::SeqCst) % n;
                (0..n).map(|i| (start + i) % n).collect()
            }
            CandidateOrder::HealthScored(pool) => {
                let mut order: Vec<usize> = pool
                    .ranked()
                    .iter()
                    .filter_map(|id| self.workers.iter().position(|w| &w.id == id))
                    .collect();
                // Workers the pool doesn't know still get their one try.
                for i in 0..n {
                    if !order.contains(&i) {
                        order.push(i);
                    }
                }
                order
            }
        }
    }

    /// Unique per job: reruns of the same task must not clobber or unlink an earlier clip.
    fn output_path(&self, req: &SliceRequest, task_id: Option<&str>) -> PathBuf {
        let stem = match task_id {
            Some(id) if !id.trim().is_empty() => sanitize_file_stem(id),
            _ => "clip".to_string(),
        };
        self.output_dir.join(format!(
            "{stem}_{}_{}_{}.mp3",
            req.start_ms,
            req.end_ms,
            random_hex(8)
        ))
    }

    pub async fn download_audio(
        &self,
        video_url: &str,
        start_ms: u64,
        end_ms: u64,
        task_id: Option<&str>,
    ) -> Result<DownloadResult> {
        let req = SliceRequest {
            video_url: video_url.to_string(),
            start_ms,
            end_ms,
        };
        req.validate().map_err(DispatchError::InvalidRequest)?;
        if self.workers.is_empty() {
            return Err(DispatchError::NoWorkers);
        }
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| DispatchError::OutputDir {
                path: self.output_dir.clone(),
                source,
            })?;

        let dest = self.output_path(&req, task_id);
        let order = self.candidate_order();
        tracing::info!(
            url = %redact_url(video_url),
            task = ?task_id,
            start_ms,
            end_ms,
            first = %self.workers[order[0]].id,
            "dispatching download"
        );

        let mut attempts: Vec<VpnAttempt> = Vec::with_capacity(order.len());
        for (pos, idx) in order.into_iter().enumerate() {
            let worker = &self.workers[idx];
            let attempt_number = pos + 1;
            self.stats.begin(&worker.id, job(task_id, video_url));

            let probe = self.transport.probe(worker).await;
            let (ip, location) = match probe {
                Ok(p) if p.public_ip.is_some() => (p.public_ip, p.location),
                Ok(_) => {
                    let error = format!("{TUNNEL_DOWN_SKIP} (no public IP reported)");
                    attempts.push(self.fail(
                        worker,
                        task_id,
                        &req,
                        None,
                        None,
                        attempt_number,
                        FailureKind::TunnelDown,
                        error,
                    ));
                    continue;
                }
                Err(reason) => {
                    let error = format!("{TUNNEL_DOWN_SKIP} ({reason})");
                    attempts.push(self.fail(
                        worker,
                        task_id,
                        &req,
                        None,
                        None,
                        attempt_number,
                        FailureKind::TunnelDown,
                        error,
                    ));
                    continue;
                }
            };

            tracing::debug!(worker = %worker.id, ip = ?ip, attempt_number, "pre-flight ok");
            match self.transport.download(worker, &req, &dest).await {
                Ok(bytes) => {
                    self.stats.record_success(&worker.id);
                    self.metrics.record_request(RequestOutcome {
                        worker_id: worker.id.clone(),
                        ip: ip.clone(),
                        location: location.clone(),
                        video_url: video_url.to_string(),
                        success: true,
                        error: None,
                        task_id: task_id.map(str::to_string),
                    });
                    if let Some(pool) = self.pool() {
                        pool.record_success(&worker.id);
                    }
                    attempts.push(VpnAttempt {
                        proxy: worker.id.clone(),
                        ip,
                        location,
                        success: true,
                        error: None,
                        failure: None,
                        attempt_number,
                    });
                    tracing::info!(worker = %worker.id, bytes, attempt_number, "download succeeded");
                    let total_attempts = attempts.len();
                    return Ok(DownloadResult {
                        file_path: dest,
                        bytes,
                        vpn_attempts: attempts,
                        total_attempts,
                        successful_proxy: Some(worker.id.clone()),
                    });
                }
                Err(failure) => {
                    remove_partial(&dest).await;
                    attempts.push(self.fail(
                        worker,
                        task_id,
                        &req,
                        ip,
                        location,
                        attempt_number,
                        failure.kind,
                        failure.message,
                    ));
                }
            }
        }

        tracing::warn!(
            url = %redact_url(video_url),
            task = ?task_id,
            attempts = attempts.len(),
            "all VPN workers failed"
        );
        Err(DispatchError::AllWorkersFailed { attempts })
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &self,
        worker: &WorkerEndpoint,
        task_id: Option<&str>,
        req: &SliceRequest,
        ip: Option<String>,
        location: Option<String>,
        attempt_number: usize,
        kind: FailureKind,
        error: String,
    ) -> VpnAttempt {
        let blocked = kind == FailureKind::Blocked;
        tracing::warn!(worker = %worker.id, attempt_number, kind = ?kind, error = %error, "attempt failed");
        self.stats.record_failure(&worker.id, &error, blocked);
        self.metrics.record_request(RequestOutcome {
            worker_id: worker.id.clone(),
            ip: ip.clone(),
            location: location.clone(),
            video_url: req.video_url.clone(),
            success: false,
            error: Some(error.clone()),
            task_id: task_id.map(str::to_string),
        });
        if let Some(pool) = self.pool() {
            pool.record_failure(&worker.id);
        }
        VpnAttempt {
            proxy: worker.id.clone(),
            ip,
            location,
            success: false,
            error: Some(error),
            failure: Some(kind),
            attempt_number,
        }
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove partial download")
        }
    }
}

fn sanitize_file_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

fn random_hex(bytes: usize) -> String {
    use std::fmt::Write as _;
    let mut raw = vec![0u8; bytes];
    if getrandom::getrandom(&mut raw).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        return format!("{nanos:x}");
    }
    let mut out = String::with_capacity(bytes * 2);
    for b in raw {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::transport::{DownloadFailure, HealthProbe};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Script {
        Down,
        ProbeError,
        Ok,
        Block,
        Timeout,
        Truncated,
    }

    struct FakeTransport {
        scripts: HashMap<String, Script>,
        calls: Mutex<Vec<(String, &'static str)>>,
    }

    impl FakeTransport {
        fn new(scripts: &[(&str, Script)]) -> Self {
            Self {
                scripts: scripts
                    .iter()
                    .map(|(id, s)| (id.to_string(), s.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, &'static str)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl WorkerTransport for FakeTransport {
        async fn probe(&self, worker: &WorkerEndpoint) -> std::result::Result<HealthProbe, String> {
            self.calls.lock().unwrap().push((worker.id.clone(), "probe"));
            match self.scripts[&worker.id] {
                Script::Down => Ok(HealthProbe::default()),
                Script::ProbeError => Err("health check timed out".to_string()),
                _ => Ok(HealthProbe {
                    public_ip: Some(format!("10.0.0.{}", worker.port)),
                    location: Some("Oslo, Norway".to_string()),
                }),
            }
        }

        async fn download(
            &self,
            worker: &WorkerEndpoint,
            _req: &SliceRequest,
            dest: &Path,
        ) -> std::result::Result<u64, DownloadFailure> {
            self.calls.lock().unwrap().push((worker.id.clone(), "download"));
            match self.scripts[&worker.id] {
                Script::Ok => {
                    tokio::fs::write(dest, b"ID3audio").await.unwrap();
                    Ok(8)
                }
                Script::Block => Err(DownloadFailure {
                    kind: FailureKind::Blocked,
                    status: Some(403),
                    message: "HTTP 403: Sign in to confirm you're not a bot".to_string(),
                }),
                Script::Timeout => Err(DownloadFailure {
                    kind: FailureKind::Timeout,
                    status: None,
                    message: "download timed out".to_string(),
                }),
                Script::Truncated => {
                    tokio::fs::write(dest, b"ID3").await.unwrap();
                    Err(DownloadFailure {
                        kind: FailureKind::Timeout,
                        status: None,
                        message: "connection reset mid-body".to_string(),
                    })
                }
                Script::Down | Script::ProbeError => unreachable!("download after failed pre-flight"),
            }
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("vpn-fleet-dispatch-{tag}-{nanos}"))
    }

    fn manager(scripts: &[(&str, Script)], tag: &str) -> VpnDownloadManager<FakeTransport> {
        let workers = scripts
            .iter()
            .enumerate()
            .map(|(i, (id, _))| WorkerEndpoint::new(*id, "127.0.0.1", 3001 + i as u16))
            .collect();
        VpnDownloadManager::new(
            workers,
            FakeTransport::new(scripts),
            Arc::new(MetricsTracker::new()),
            temp_dir(tag),
        )
    }

    const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    #[tokio::test]
    async fn rotation_start_advances_by_one_per_job() {
        let m = manager(
            &[("worker-1", Script::Ok), ("worker-2", Script::Ok), ("worker-3", Script::Ok)],
            "rotation",
        );
        let mut winners = Vec::new();
        for _ in 0..7 {
            assert_eq!(m.rotation_index(), winners.len() % 3);
            let r = m.download_audio(URL, 0, 5000, None).await.unwrap();
            winners.push(r.successful_proxy.unwrap());
        }
        assert_eq!(
            winners,
            vec![
                "worker-1", "worker-2", "worker-3", "worker-1", "worker-2", "worker-3", "worker-1"
            ]
        );
        let _ = std::fs::remove_dir_all(&m.output_dir);
    }

    #[tokio::test]
    async fn first_success_stops_the_job() {
        let m = manager(&[("worker-1", Script::Ok), ("worker-2", Script::Ok)], "first");
        let r = m.download_audio(URL, 1000, 4000, Some("task-9")).await.unwrap();
        assert_eq!(r.total_attempts, 1);
        assert_eq!(r.vpn_attempts.len(), 1);
        assert!(r.vpn_attempts[0].success);
        assert_eq!(r.bytes, 8);
        let name = r.file_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("task-9_1000_4000_") && name.ends_with(".mp3"), "{name}");
        assert!(r.file_path.exists());
        assert!(m.transport.calls().iter().all(|(id, _)| id == "worker-1"));
        let _ = std::fs::remove_dir_all(&m.output_dir);
    }

    #[tokio::test]
    async fn rerun_of_a_task_keeps_earlier_clips() {
        let ok = manager(&[("worker-1", Script::Ok)], "rerun");
        let first = ok.download_audio(URL, 0, 1000, Some("task-7")).await.unwrap();
        let second = ok.download_audio(URL, 0, 1000, Some("task-7")).await.unwrap();
        assert_ne!(first.file_path, second.file_path);

        let failing = VpnDownloadManager::new(
            vec![WorkerEndpoint::new("worker-1", "127.0.0.1", 3001)],
            FakeTransport::new(&[("worker-1", Script::Truncated)]),
            Arc::new(MetricsTracker::new()),
            ok.output_dir.clone(),
        );
        assert!(failing.download_audio(URL, 0, 1000, Some("task-7")).await.is_err());

        assert!(first.file_path.exists());
        assert!(second.file_path.exists());
        let left = std::fs::read_dir(&ok.output_dir).unwrap().count();
        assert_eq!(left, 2, "partial download must be removed");
        let _ = std::fs::remove_dir_all(&ok.output_dir);
    }

    #[tokio::test]
    async fn tunnel_down_is_skipped_without_download_call() {
        let m = manager(&[("worker-1", Script::Down), ("worker-2", Script::Ok)], "skip");
        let r = m.download_audio(URL, 0, 3000, None).await.unwrap();
        assert_eq!(r.successful_proxy.as_deref(), Some("worker-2"));
        assert_eq!(
            m.transport.calls(),
            vec![
                ("worker-1".to_string(), "probe"),
                ("worker-2".to_string(), "probe"),
                ("worker-2".to_string(), "download"),
            ]
        );
        let skipped = &r.vpn_attempts[0];
        assert!(!skipped.success);
        assert_eq!(skipped.failure, Some(FailureKind::TunnelDown));
        assert!(skipped.error.as_deref().unwrap().starts_with(TUNNEL_DOWN_SKIP));
        let _ = std::fs::remove_dir_all(&m.output_dir);
    }

    #[tokio::test]
    async fn two_down_then_third_succeeds() {
        let m = manager(
            &[
                ("worker-1", Script::Down),
                ("worker-2", Script::ProbeError),
                ("worker-3", Script::Ok),
            ],
            "scenario",
        );
        let r = m.download_audio(URL, 0, 10_000, Some("job-1")).await.unwrap();
        assert_eq!(r.total_attempts, 3);
        assert_eq!(r.successful_proxy.as_deref(), Some("worker-3"));
        for (i, a) in r.vpn_attempts[..2].iter().enumerate() {
            assert_eq!(a.attempt_number, i + 1);
            assert!(!a.success);
            assert!(a.ip.is_none());
            assert!(a.error.as_deref().unwrap().starts_with(TUNNEL_DOWN_SKIP));
        }
        assert_eq!(r.vpn_attempts[2].attempt_number, 3);

        // Skips still reach the metrics ledger, without an IP.
        let trail = m.metrics().attempts_for_task("job-1");
        assert_eq!(trail.len(), 3);
        assert!(trail[0].ip.is_none());
        assert_eq!(trail[2].ip.as_deref(), Some("10.0.0.3003"));
        let _ = std::fs::remove_dir_all(&m.output_dir);
    }

    #[tokio::test]
    async fn exhausted_fleet_reports_every_worker() {
        let m = manager(
            &[
                ("worker-1", Script::Block),
                ("worker-2", Script::Timeout),
                ("worker-3", Script::Down),
            ],
            "exhausted",
        );
        let err = m.download_audio(URL, 0, 2000, None).await.unwrap_err();
        let attempts = err.attempts();
        assert_eq!(attempts.len(), 3);
        let msg = err.to_string();
        for id in ["worker-1", "worker-2", "worker-3"] {
            assert!(msg.contains(id), "{msg}");
        }
        assert!(msg.contains("Sign in to confirm"));
        assert!(msg.contains("download timed out"));

        let w1 = m.stats().get("worker-1").unwrap();
        assert_eq!((w1.attempts, w1.failures, w1.blocks), (1, 1, 1));
        let w2 = m.stats().get("worker-2").unwrap();
        assert_eq!((w2.attempts, w2.failures, w2.blocks), (1, 1, 0));
        for s in m.stats().snapshot() {
            assert_eq!(s.attempts, s.successes + s.failures);
        }
        // No partial file left behind.
        let leftover = std::fs::read_dir(&m.output_dir).unwrap().count();
        assert_eq!(leftover, 0);
        let _ = std::fs::remove_dir_all(&m.output_dir);
    }

    #[tokio::test]
    async fn each_worker_tried_once_even_when_rotation_starts_mid_list() {
        let m = manager(
            &[
                ("worker-1", Script::Block),
                ("worker-2", Script::Block),
                ("worker-3", Script::Block),
            ],
            "once",
        );
        let _ = m.download_audio(URL, 0, 1000, None).await;
        let err = m.download_audio(URL, 0, 1000, None).await.unwrap_err();
        let order: Vec<&str> = err.attempts().iter().map(|a| a.proxy.as_str()).collect();
        assert_eq!(order, vec!["worker-2", "worker-3", "worker-1"]);
        let _ = std::fs::remove_dir_all(&m.output_dir);
    }

    #[tokio::test]
    async fn health_scored_order_prefers_reliable_worker() {
        let pool = Arc::new(HealthScoredPool::new([
            "worker-1".to_string(),
            "worker-2".to_string(),
        ]));
        pool.record_failure("worker-1");
        let m = manager(&[("worker-1", Script::Ok), ("worker-2", Script::Ok)], "scored")
            .with_order(CandidateOrder::HealthScored(pool.clone()));
        let r = m.download_audio(URL, 0, 1000, None).await.unwrap();
        assert_eq!(r.successful_proxy.as_deref(), Some("worker-2"));
        let _ = std::fs::remove_dir_all(&m.output_dir);
    }

    #[tokio::test]
    async fn rejects_empty_fleet_and_bad_ranges() {
        let m = manager(&[], "empty");
        assert!(matches!(
            m.download_audio(URL, 0, 1000, None).await,
            Err(DispatchError::NoWorkers)
        ));
        let m = manager(&[("worker-1", Script::Ok)], "range");
        assert!(matches!(
            m.download_audio(URL, 2000, 1000, None).await,
            Err(DispatchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(sanitize_file_stem("a/b c:1"), "a_b_c_1");
        assert_eq!(random_hex(4).len(), 8);
    }
}
