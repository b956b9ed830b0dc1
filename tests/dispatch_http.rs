use axum::{
    Json, Router,
    body::Bytes,
    http::StatusCode,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use vpn_fleet::{
    dispatch::{DispatchError, FailureKind, HttpWorkerTransport, VpnDownloadManager, WorkerEndpoint},
    metrics::MetricsTracker,
    tunnel::TunnelControl,
    worker::{self, WorkerState, YtDlp},
};

const AUDIO: &[u8] = b"ID3\x04\x00fake-mp3-frames";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}_{}_{}", std::process::id(), id))
}

fn dead_url() -> String {
    let listener =
        std::net::TcpListener::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

async fn serve(app: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0))
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// A real worker whose tunnel control API is not reachable.
async fn spawn_worker_with_dead_tunnel(id: &str, scratch: &std::path::Path) -> u16 {
    let http = reqwest::Client::new();
    let state = WorkerState::new(
        id,
        TunnelControl::new(dead_url(), http, Duration::from_millis(300)),
        YtDlp::new("yt-dlp", scratch, Duration::from_secs(5)),
    );
    serve(worker::build_app(state)).await
}

/// Healthy worker that answers every download with fixed audio bytes.
async fn spawn_audio_worker(id: &'static str, ip: &'static str, seen: Arc<AtomicU64>) -> u16 {
    let app = Router::new()
        .route(
            "/health",
            get(move || async move {
                Json(json!({
                    "worker": id,
                    "status": "ok",
                    "vpn": { "public_ip": ip, "country": "Netherlands", "city": "Amsterdam" },
                }))
            }),
        )
        .route(
            "/download",
            post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    assert_eq!(body["startMs"], 1000);
                    assert_eq!(body["endMs"], 4000);
                    seen.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::OK,
                        [("content-type", "audio/mpeg")],
                        Bytes::from_static(AUDIO),
                    )
                }
            }),
        );
    serve(app).await
}

fn manager(
    workers: Vec<WorkerEndpoint>,
    out_dir: &std::path::Path,
) -> VpnDownloadManager<HttpWorkerTransport> {
    let transport = HttpWorkerTransport::new(
        reqwest::Client::new(),
        Duration::from_secs(2),
        Duration::from_secs(5),
    );
    VpnDownloadManager::new(workers, transport, Arc::new(MetricsTracker::new()), out_dir)
}

#[tokio::test]
async fn tunnel_down_worker_is_skipped_and_next_worker_delivers() {
    let scratch = unique_temp_dir("vpn_fleet_dispatch_scratch");
    let out_dir = unique_temp_dir("vpn_fleet_dispatch_out");
    let downloads = Arc::new(AtomicU64::new(0));

    let down_port = spawn_worker_with_dead_tunnel("worker-1", &scratch).await;
    let ok_port = spawn_audio_worker("worker-2", "203.0.113.7", downloads.clone()).await;

    let mgr = manager(
        vec![
            WorkerEndpoint::new("worker-1", "127.0.0.1", down_port),
            WorkerEndpoint::new("worker-2", "127.0.0.1", ok_port),
        ],
        &out_dir,
    );

    let result = mgr
        .download_audio("https://www.youtube.com/watch?v=abc", 1000, 4000, Some("job-1"))
        .await
        .expect("second worker should deliver");

    assert_eq!(result.total_attempts, 2);
    assert_eq!(result.successful_proxy.as_deref(), Some("worker-2"));
    assert_eq!(result.bytes, AUDIO.len() as u64);
    assert_eq!(tokio::fs::read(&result.file_path).await.unwrap(), AUDIO);
    assert_eq!(downloads.load(Ordering::SeqCst), 1);

    let first = &result.vpn_attempts[0];
    assert_eq!(first.proxy, "worker-1");
    assert!(!first.success);
    assert_eq!(first.ip, None);
    assert_eq!(first.failure, Some(FailureKind::TunnelDown));
    assert!(first.error.as_deref().unwrap().starts_with("VPN is down, skipping"));

    let second = &result.vpn_attempts[1];
    assert!(second.success);
    assert_eq!(second.ip.as_deref(), Some("203.0.113.7"));
    assert_eq!(second.location.as_deref(), Some("Amsterdam, Netherlands"));

    let m = mgr.metrics().worker_metrics("worker-2").unwrap();
    assert_eq!(m.current_ip.as_deref(), Some("203.0.113.7"));
    assert_eq!(m.total_success, 1);

    let _ = tokio::fs::remove_dir_all(&out_dir).await;
}

#[tokio::test]
async fn unreachable_fleet_reports_one_attempt_per_worker() {
    let out_dir = unique_temp_dir("vpn_fleet_dispatch_out");
    let mgr = manager(
        vec![
            WorkerEndpoint::from_config(&vpn_fleet::config::WorkerEndpointConfig {
                id: "worker-1".to_string(),
                url: dead_url(),
            })
            .unwrap(),
            WorkerEndpoint::from_config(&vpn_fleet::config::WorkerEndpointConfig {
                id: "worker-2".to_string(),
                url: dead_url(),
            })
            .unwrap(),
        ],
        &out_dir,
    );

    let err = mgr
        .download_audio("https://youtu.be/xyz", 0, 2000, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::AllWorkersFailed { .. }));
    let attempts = err.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| !a.success));
    assert_eq!(
        attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
        vec![1, 2]
    );
    for stats in mgr.stats().snapshot() {
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.failures, 1);
        assert!(stats.current_job.is_none());
    }

    let _ = tokio::fs::remove_dir_all(&out_dir).await;
}
