use std::sync::{Arc, Mutex};

use storage_latency_probe::{
    server::{Endpoint, LoopbackServer},
    transfer::ProgressSink,
    BucketRegion, ControllerStatus, Operation, PresignError, ProbeConfig, ProbeError,
    TransferController, TransferError, TransferProgress, UploadFile,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn init_tracing() {
    // Every test tries; only the first one installs the subscriber.
    let _ = tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_env_filter(EnvFilter::new("debug"))
            .with_test_writer()
            .finish(),
    );
}

#[derive(Default)]
struct Recorder(Mutex<Vec<TransferProgress>>);

impl ProgressSink for Recorder {
    fn on_progress(&self, progress: TransferProgress) {
        self.0.lock().unwrap().push(progress);
    }
}

impl Recorder {
    fn events(&self) -> Vec<TransferProgress> {
        self.0.lock().unwrap().clone()
    }
}

async fn start_server() -> LoopbackServer {
    init_tracing();
    let mut server = LoopbackServer::new();
    server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    server
}

fn controller_for(server: &LoopbackServer, download_dir: &std::path::Path) -> TransferController {
    let mut config = ProbeConfig::default().with_base_url(&server.base_url().unwrap());
    config.download_dir = download_dir.to_path_buf();
    config.chunk_size = 16 * 1024;
    TransferController::from_config(&config)
}

fn assert_non_decreasing(events: &[TransferProgress]) {
    for pair in events.windows(2) {
        assert!(pair[0].transferred <= pair[1].transferred, "{:?}", pair);
    }
}

#[tokio::test]
async fn test_upload_through_loopback() {
    let mut server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let controller = controller_for(&server, dir.path()).with_observer(recorder.clone());

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let file = UploadFile::new("clip.mp4", "video/mp4", payload.clone());
    let record = controller
        .upload(&file, BucketRegion::EuWest1, false)
        .await
        .unwrap();

    assert_eq!(record.operation, Operation::Upload);
    assert_eq!(record.bucket_region, BucketRegion::EuWest1);
    assert_eq!(record.file_name, "clip.mp4");
    assert_eq!(record.file_path, "/clip.mp4");
    assert_eq!(record.file_size, 100_000);
    assert_eq!(record.duration_ms, record.end_ms - record.start_ms);
    assert_eq!(server.object("clip.mp4").unwrap(), payload);

    let events = recorder.events();
    assert_non_decreasing(&events);
    let last = events.last().unwrap();
    assert_eq!(last.transferred, 100_000);
    assert_eq!(last.percent(), Some(100));

    controller.stats().flush().await;
    assert_eq!(server.stats_records(), vec![record]);
    assert_eq!(controller.status(), ControllerStatus::default());
    server.stop().await;
}

#[tokio::test]
async fn test_upload_name_with_space() {
    let mut server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let controller = controller_for(&server, dir.path());

    let file = UploadFile::new("my clip.mp4", "video/mp4", vec![7u8; 2048]);
    let record = controller
        .upload(&file, BucketRegion::EuWest1, false)
        .await
        .unwrap();

    assert_eq!(record.file_name, "my clip.mp4");
    assert_eq!(record.file_path, "/my clip.mp4");
    assert_eq!(server.object("my clip.mp4").unwrap(), vec![7u8; 2048]);

    // The stored object is served back under its escaped URL.
    let url = server.object_url("my clip.mp4").unwrap();
    assert!(url.ends_with("/objects/my%20clip%2Emp4"));
    let download = controller
        .download(&url, BucketRegion::EuWest1)
        .await
        .unwrap();
    assert_eq!(download.file_size, 2048);
    server.stop().await;
}

#[tokio::test]
async fn test_download_through_loopback() {
    let mut server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    server.put_object("file.mp4", vec![3u8; 200_000]);
    let recorder = Arc::new(Recorder::default());
    let controller = controller_for(&server, dir.path()).with_observer(recorder.clone());

    let url = server.object_url("file.mp4").unwrap();
    let record = controller
        .download(&url, BucketRegion::ApSoutheast3)
        .await
        .unwrap();

    assert_eq!(record.operation, Operation::Download);
    assert_eq!(record.bucket_region, BucketRegion::ApSoutheast3);
    assert_eq!(record.file_size, 200_000);
    assert_eq!(record.file_name, "file.mp4");
    assert_eq!(record.file_path, url);
    assert_eq!(
        std::fs::read(dir.path().join("file.mp4")).unwrap(),
        vec![3u8; 200_000]
    );

    let events = recorder.events();
    assert_non_decreasing(&events);
    assert!(events.last().unwrap().is_complete());

    controller.stats().flush().await;
    assert_eq!(server.stats_records(), vec![record]);
    server.stop().await;
}

#[tokio::test]
async fn test_presign_failure_never_uploads() {
    let mut server = start_server().await;
    server.fail_endpoint(Endpoint::Presign, 500);
    let dir = tempfile::tempdir().unwrap();
    let controller = controller_for(&server, dir.path());

    let file = UploadFile::new("clip.mp4", "video/mp4", vec![0u8; 1024]);
    let err = controller
        .upload(&file, BucketRegion::EuWest1, false)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProbeError::Presign(PresignError::Status { status: 500, .. })
    ));
    assert_eq!(server.request_count(Endpoint::Presign), 1);
    assert_eq!(server.request_count(Endpoint::Put), 0);
    assert_eq!(controller.status(), ControllerStatus::default());

    controller.stats().flush().await;
    assert!(server.stats_records().is_empty());

    // The controller accepts new attempts after a failure.
    server.clear_failures();
    assert!(controller
        .upload(&file, BucketRegion::EuWest1, false)
        .await
        .is_ok());
    server.stop().await;
}

#[tokio::test]
async fn test_failed_put_is_not_reported() {
    let mut server = start_server().await;
    server.fail_endpoint(Endpoint::Put, 503);
    let dir = tempfile::tempdir().unwrap();
    let controller = controller_for(&server, dir.path());

    let file = UploadFile::new("clip.mp4", "video/mp4", vec![0u8; 1024]);
    let err = controller
        .upload(&file, BucketRegion::EuWest1, true)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProbeError::Transfer(TransferError::Status { status: 503 })
    ));
    controller.stats().flush().await;
    assert_eq!(server.request_count(Endpoint::Stats), 0);
    assert_eq!(controller.status(), ControllerStatus::default());
    server.stop().await;
}

#[tokio::test]
async fn test_missing_object_fails_download() {
    let mut server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let controller = controller_for(&server, dir.path());

    let url = server.object_url("absent.mp4").unwrap();
    let err = controller
        .download(&url, BucketRegion::EuWest1)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProbeError::Transfer(TransferError::Status { status: 404 })
    ));
    assert!(!dir.path().join("absent.mp4").exists());
    controller.stats().flush().await;
    assert_eq!(server.request_count(Endpoint::Stats), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_stats_failure_does_not_touch_record() {
    let mut server = start_server().await;
    server.fail_endpoint(Endpoint::Stats, 500);
    let dir = tempfile::tempdir().unwrap();
    let controller = controller_for(&server, dir.path());

    let file = UploadFile::new("clip.mp4", "video/mp4", vec![0u8; 4096]);
    let record = controller
        .upload(&file, BucketRegion::EuWest1, false)
        .await
        .unwrap();
    controller.stats().flush().await;

    assert_eq!(server.request_count(Endpoint::Stats), 1);
    assert!(server.stats_records().is_empty());
    assert_eq!(record.file_path, "/clip.mp4");
    assert_eq!(record.file_size, 4096);
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_presign_endpoint() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    // Bind and drop a listener to get a port nobody serves.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let mut config = ProbeConfig::default().with_base_url(&format!("http://{}", addr));
    config.download_dir = dir.path().to_path_buf();
    let controller = TransferController::from_config(&config);

    let file = UploadFile::new("clip.mp4", "video/mp4", vec![0u8; 16]);
    let err = controller
        .upload(&file, BucketRegion::EuWest1, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::Presign(PresignError::Unreachable(_))));
    assert_eq!(err.phase(), "presigning");
}
