use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use hyper::Uri;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    client::HttpClient,
    common::{BucketRegion, Clock, ProbeConfig, SystemClock},
    error::{ProbeError, TransferError},
    message::{Operation, StatsRecord, TransferProgress},
    presign::{HttpPresignClient, PresignClient},
    stats::{HttpStatsReporter, StatsDispatcher},
    transfer::{HttpTransferExecutor, ProgressSink, TransferExecutor},
};

/// Saved name for downloads whose URL has no usable final segment.
const FALLBACK_FILE_NAME: &str = "download";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Phase of the attempt currently driven by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// Waiting for the presign endpoint, uploads only.
    Presigning,
    Transferring,
    /// Building and dispatching the stats record.
    Completing,
    /// The attempt failed; the controller returns to `Idle` right after.
    Failed,
}

/// Snapshot of a controller, published to subscribers on every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    pub phase: Phase,
    pub progress: TransferProgress,
    /// Whether an attempt is in flight.
    pub loading: bool,
}

/// A file to upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk, sniffing its MIME type from the content.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ProbeError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ProbeError::InvalidInput(format!("{} does not name a file", path.display()))
            })?;
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            ProbeError::InvalidInput(format!("cannot read {}: {}", path.display(), err))
        })?;
        let content_type = infer::get(&bytes)
            .map(|kind| kind.mime_type())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        debug!("Loaded {} ({} bytes, {})", name, bytes.len(), content_type);

        Ok(Self::new(name, content_type, bytes))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Final path segment of a URL, used as the name of a downloaded file.
pub fn file_name_from_url(url: &str) -> String {
    let path = url
        .parse::<Uri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    match path.rsplit('/').next() {
        Some(segment) if !segment.is_empty() && segment != "." && segment != ".." => {
            segment.to_string()
        }
        _ => FALLBACK_FILE_NAME.to_string(),
    }
}

/// Forwards executor progress into the controller status and observers,
/// dropping events that would move progress backwards.
struct AttemptProgress {
    status: Arc<watch::Sender<ControllerStatus>>,
    observers: Vec<Arc<dyn ProgressSink>>,
}

impl ProgressSink for AttemptProgress {
    fn on_progress(&self, progress: TransferProgress) {
        let advanced = self.status.send_if_modified(|status| {
            if status.phase != Phase::Transferring
                || progress.transferred < status.progress.transferred
            {
                return false;
            }
            let changed = status.progress != progress;
            status.progress = progress;
            changed
        });
        if advanced {
            for observer in &self.observers {
                observer.on_progress(progress);
            }
        }
    }
}

/// Gate held for the lifetime of one attempt. Dropping it, on any path,
/// returns the controller to `Idle`.
struct Attempt {
    busy: Arc<AtomicBool>,
    status: Arc<watch::Sender<ControllerStatus>>,
}

impl Attempt {
    fn enter(&self, phase: Phase) {
        debug!("Attempt enters {:?}", phase);
        self.status.send_modify(|status| status.phase = phase);
    }

    fn fail(self, err: ProbeError) -> ProbeError {
        error!("Attempt failed while {}: {}", err.phase(), err);
        self.status.send_modify(|status| {
            status.phase = Phase::Failed;
            status.progress = TransferProgress::default();
            status.loading = false;
        });
        err
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.status.send_modify(|status| {
            *status = ControllerStatus::default();
        });
        self.busy.store(false, Ordering::Release);
    }
}

/// Drives upload and download attempts and reports their stats.
///
/// One attempt runs at a time; a request made while another is in flight is
/// rejected with [`ProbeError::Busy`].
pub struct TransferController {
    presign: Arc<dyn PresignClient>,
    executor: Arc<dyn TransferExecutor>,
    stats: StatsDispatcher,
    clock: Arc<dyn Clock>,
    download_dir: PathBuf,
    observers: Vec<Arc<dyn ProgressSink>>,
    busy: Arc<AtomicBool>,
    status: Arc<watch::Sender<ControllerStatus>>,
}

impl TransferController {
    pub fn new(
        presign: Arc<dyn PresignClient>,
        executor: Arc<dyn TransferExecutor>,
        stats: StatsDispatcher,
    ) -> Self {
        let (status, _) = watch::channel(ControllerStatus::default());
        Self {
            presign,
            executor,
            stats,
            clock: Arc::new(SystemClock),
            download_dir: PathBuf::from("."),
            observers: Vec::new(),
            busy: Arc::new(AtomicBool::new(false)),
            status: Arc::new(status),
        }
    }

    /// Wire HTTP collaborators from a config. Must be called within a tokio runtime.
    pub fn from_config(config: &ProbeConfig) -> Self {
        let client = HttpClient::new(config.timeouts.clone());
        let presign = Arc::new(HttpPresignClient::new(
            client.clone(),
            config.presign_endpoint.clone(),
        ));
        let executor = Arc::new(HttpTransferExecutor::new(client.clone(), config.chunk_size));
        let reporter = Arc::new(HttpStatsReporter::new(client, config.stats_endpoint.clone()));

        Self::new(presign, executor, StatsDispatcher::spawn(reporter))
            .with_download_dir(config.download_dir.clone())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Register an observer receiving every progress event in order.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressSink>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn status(&self) -> ControllerStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.subscribe()
    }

    pub fn stats(&self) -> &StatsDispatcher {
        &self.stats
    }

    fn begin(&self, phase: Phase) -> Result<Attempt, ProbeError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Rejecting request, a transfer is already in progress");
            return Err(ProbeError::Busy);
        }
        self.status.send_replace(ControllerStatus {
            phase,
            progress: TransferProgress::default(),
            loading: true,
        });
        Ok(Attempt {
            busy: self.busy.clone(),
            status: self.status.clone(),
        })
    }

    fn progress_sink(&self) -> Arc<dyn ProgressSink> {
        Arc::new(AttemptProgress {
            status: self.status.clone(),
            observers: self.observers.clone(),
        })
    }

    fn complete(&self, attempt: Attempt, record: StatsRecord) -> StatsRecord {
        attempt.enter(Phase::Completing);
        if let Err(err) = self.stats.dispatch(record.clone()) {
            warn!("Stats for {} not queued: {}", record.file_name, err);
        }
        info!(
            "{} of {} ({} bytes) in {} took {} ms",
            record.operation,
            record.file_name,
            record.file_size,
            record.bucket_region,
            record.duration_ms
        );
        drop(attempt);
        record
    }

    /// Presign, upload `file` to `region` and report the timing.
    pub async fn upload(
        &self,
        file: &UploadFile,
        region: BucketRegion,
        accelerated: bool,
    ) -> Result<StatsRecord, ProbeError> {
        if file.name.is_empty() {
            return Err(ProbeError::InvalidInput(
                "upload file needs a name".to_string(),
            ));
        }
        let attempt = self.begin(Phase::Presigning)?;
        info!(
            "Uploading {} ({} bytes) to {} (accelerated: {})",
            file.name,
            file.size(),
            region,
            accelerated
        );

        let target = match self
            .presign
            .request_single(&file.name, region, accelerated)
            .await
        {
            Ok(target) => target,
            Err(err) => return Err(attempt.fail(err.into())),
        };

        attempt.enter(Phase::Transferring);
        let sink = self.progress_sink();
        let start = self.clock.now_epoch_ms();
        let result = self
            .executor
            .put(&target.upload_url, file.bytes.clone(), &file.content_type, sink)
            .await;
        let end = self.clock.now_epoch_ms();
        if let Err(err) = result {
            return Err(attempt.fail(err.into()));
        }

        let record = StatsRecord::new(
            region,
            Operation::Upload,
            start,
            end,
            file.size(),
            file.name.clone(),
            target.file_path,
        );
        Ok(self.complete(attempt, record))
    }

    /// Download `url` from `region`, save it locally and report the timing.
    pub async fn download(
        &self,
        url: &str,
        region: BucketRegion,
    ) -> Result<StatsRecord, ProbeError> {
        let attempt = self.begin(Phase::Transferring)?;
        let file_name = file_name_from_url(url);
        info!("Downloading {} from {}", url, region);

        let sink = self.progress_sink();
        let start = self.clock.now_epoch_ms();
        let result = self.executor.get(url, sink).await;
        let end = self.clock.now_epoch_ms();
        let downloaded = match result {
            Ok(downloaded) => downloaded,
            Err(err) => return Err(attempt.fail(err.into())),
        };

        let path = self.download_dir.join(&file_name);
        if let Err(source) = tokio::fs::write(&path, &downloaded.bytes).await {
            let err = TransferError::Save {
                path: path.display().to_string(),
                source,
            };
            return Err(attempt.fail(err.into()));
        }
        debug!("Saved {} bytes to {}", downloaded.bytes.len(), path.display());

        let file_size = downloaded
            .content_length()
            .unwrap_or(downloaded.bytes.len() as u64);
        let record = StatsRecord::new(
            region,
            Operation::Download,
            start,
            end,
            file_size,
            file_name,
            url,
        );
        Ok(self.complete(attempt, record))
    }
}
