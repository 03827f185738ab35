use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use hyper::{
    body::HttpBody,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    Body, HeaderMap, Method, Request, Uri,
};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::{
    client::{ClientError, HttpClient},
    common::DEFAULT_CHUNK_SIZE,
    error::TransferError,
    message::TransferProgress,
};

/// Receives progress events of a running transfer.
///
/// Events of one transfer arrive in order with non-decreasing `transferred`.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TransferProgress);
}

/// A fully received download.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: Bytes,
    pub headers: HeaderMap,
}

impl Downloaded {
    /// The `Content-Length` response header, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        content_length(&self.headers)
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Moves bytes to and from storage endpoints.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Upload `body` to `url`. Completes once the endpoint acknowledges it.
    async fn put(
        &self,
        url: &str,
        body: Bytes,
        content_type: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError>;

    /// Download the payload at `url` together with the response headers.
    async fn get(&self, url: &str, progress: Arc<dyn ProgressSink>)
        -> Result<Downloaded, TransferError>;
}

/// Transfer executor on top of the shared [`HttpClient`].
#[derive(Clone)]
pub struct HttpTransferExecutor {
    client: HttpClient,
    chunk_size: usize,
}

impl HttpTransferExecutor {
    pub fn new(client: HttpClient, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self { client, chunk_size }
    }

    fn parse_url(url: &str) -> Result<Uri, TransferError> {
        let uri = url
            .parse::<Uri>()
            .map_err(|err| TransferError::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(TransferError::InvalidUrl {
                url: url.to_string(),
                reason: "url is not absolute".to_string(),
            });
        }
        Ok(uri)
    }

    /// Split the payload into a body stream reporting progress as hyper pulls
    /// each chunk onto the connection.
    fn progress_body(&self, body: Bytes, progress: Arc<dyn ProgressSink>) -> Body {
        let total = body.len() as u64;
        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(self.chunk_size)
            .map(|start| body.slice(start..(start + self.chunk_size).min(body.len())))
            .collect();

        progress.on_progress(TransferProgress::new(0, Some(total)));
        let mut sent = 0u64;
        let stream = stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            progress.on_progress(TransferProgress::new(sent, Some(total)));
            Ok::<_, std::io::Error>(chunk)
        });
        Body::wrap_stream(stream)
    }
}

fn network_error(err: ClientError) -> TransferError {
    TransferError::Network(err.to_string())
}

#[async_trait]
impl TransferExecutor for HttpTransferExecutor {
    async fn put(
        &self,
        url: &str,
        body: Bytes,
        content_type: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError> {
        let uri = Self::parse_url(url)?;
        let len = body.len();

        // Pre-signed PUTs reject chunked encoding, so the length is always set.
        let req = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, len)
            .body(self.progress_body(body, progress))
            .map_err(|err| TransferError::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let resp = self.client.send(req).await.map_err(network_error)?;
        let status = resp.status();
        // Drain the acknowledgement so the connection returns to the pool.
        let _ = hyper::body::to_bytes(resp.into_body()).await;
        if !status.is_success() {
            debug!("PUT {} answered {}", url, status);
            return Err(TransferError::Status {
                status: status.as_u16(),
            });
        }

        info!("Uploaded {} bytes", len);
        Ok(())
    }

    async fn get(
        &self,
        url: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Downloaded, TransferError> {
        let uri = Self::parse_url(url)?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .map_err(|err| TransferError::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let request_timeout = self.client.timeout_options().request_timeout;
        let exchange = async {
            let resp = self.client.send(req).await.map_err(network_error)?;
            let status = resp.status();
            if !status.is_success() {
                debug!("GET {} answered {}", url, status);
                return Err(TransferError::Status {
                    status: status.as_u16(),
                });
            }

            let headers = resp.headers().clone();
            let total = content_length(&headers);
            let mut body = resp.into_body();
            let capacity = total.unwrap_or(0).min(64 * 1024 * 1024) as usize;
            let mut buf = BytesMut::with_capacity(capacity);
            let mut received = 0u64;
            progress.on_progress(TransferProgress::new(0, total));

            while let Some(chunk) = body.data().await {
                let chunk = chunk.map_err(|err| TransferError::Network(err.to_string()))?;
                received += chunk.len() as u64;
                buf.extend_from_slice(&chunk);
                progress.on_progress(TransferProgress::new(received, total));
            }

            info!("Downloaded {} bytes", received);
            Ok(Downloaded {
                bytes: buf.freeze(),
                headers,
            })
        };

        match timeout(request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Network(format!(
                "download timed out after {:?}",
                request_timeout
            ))),
        }
    }
}
