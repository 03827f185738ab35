use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    client::HttpClient,
    error::ReportingError,
    message::{Encode, StatsRecord},
};

/// Delivers stats records to a collection endpoint.
#[async_trait]
pub trait StatsReporter: Send + Sync {
    async fn report(&self, record: &StatsRecord) -> Result<(), ReportingError>;
}

/// Reporter posting JSON records over HTTP.
#[derive(Clone)]
pub struct HttpStatsReporter {
    client: HttpClient,
    endpoint: String,
}

impl HttpStatsReporter {
    pub fn new(client: HttpClient, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl StatsReporter for HttpStatsReporter {
    async fn report(&self, record: &StatsRecord) -> Result<(), ReportingError> {
        let body = record
            .encode()
            .map_err(|err| ReportingError::Encode(err.to_string()))?;
        let (status, _) = self
            .client
            .post_json(&self.endpoint, body)
            .await
            .map_err(|err| ReportingError::Unreachable(err.to_string()))?;
        if !status.is_success() {
            return Err(ReportingError::Status(status.as_u16()));
        }
        debug!("Reported {} stats for {}", record.operation, record.file_name);
        Ok(())
    }
}

enum Command {
    Report(StatsRecord),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front of a [`StatsReporter`].
///
/// Records are queued on an unbounded channel and posted one by one by a
/// background task; failures are logged and dropped.
#[derive(Clone)]
pub struct StatsDispatcher {
    tx: flume::Sender<Command>,
}

impl StatsDispatcher {
    /// Start the delivery task. Must be called within a tokio runtime.
    pub fn spawn(reporter: Arc<dyn StatsReporter>) -> Self {
        let (tx, rx) = flume::unbounded::<Command>();
        tokio::spawn(async move {
            while let Ok(command) = rx.recv_async().await {
                match command {
                    Command::Report(record) => {
                        if let Err(err) = reporter.report(&record).await {
                            warn!("Failed to report {} stats: {}", record.operation, err);
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Stats dispatcher stopped");
        });
        Self { tx }
    }

    /// Queue a record without waiting for delivery.
    pub fn dispatch(&self, record: StatsRecord) -> Result<(), ReportingError> {
        self.tx
            .send(Command::Report(record))
            .map_err(|_| ReportingError::Closed)
    }

    /// Wait until every record queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
