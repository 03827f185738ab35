use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    client::HttpClient,
    common::BucketRegion,
    error::PresignError,
    message::{Decode, Encode, PresignRequest, PresignedTarget},
};

/// Obtains writable upload URLs from a presign service.
#[async_trait]
pub trait PresignClient: Send + Sync {
    /// Ask for upload targets for `file_names` and return the first one.
    async fn request_upload_target(
        &self,
        file_names: &[String],
        bucket_region: BucketRegion,
        accelerated: bool,
    ) -> Result<PresignedTarget, PresignError>;

    /// Single-file convenience around [`PresignClient::request_upload_target`].
    async fn request_single(
        &self,
        file_name: &str,
        bucket_region: BucketRegion,
        accelerated: bool,
    ) -> Result<PresignedTarget, PresignError> {
        self.request_upload_target(&[file_name.to_string()], bucket_region, accelerated)
            .await
    }
}

/// Presign client talking JSON over HTTP to a fixed endpoint.
#[derive(Clone)]
pub struct HttpPresignClient {
    client: HttpClient,
    endpoint: String,
}

impl HttpPresignClient {
    pub fn new(client: HttpClient, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PresignClient for HttpPresignClient {
    async fn request_upload_target(
        &self,
        file_names: &[String],
        bucket_region: BucketRegion,
        accelerated: bool,
    ) -> Result<PresignedTarget, PresignError> {
        if file_names.is_empty() {
            return Err(PresignError::NoFiles);
        }

        let body = PresignRequest {
            files: file_names.to_vec(),
            bucket_region,
            accelerated,
        }
        .encode()
        .map_err(|err| PresignError::Malformed(err.to_string()))?;

        let (status, resp_body) = self
            .client
            .post_json(&self.endpoint, body)
            .await
            .map_err(|err| PresignError::Unreachable(err.to_string()))?;

        if !status.is_success() {
            debug!("Presign endpoint answered {}", status);
            return Err(PresignError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&resp_body).into_owned(),
            });
        }

        let target = PresignedTarget::decode(&resp_body)?;
        info!(
            "Presigned {} in {} (accelerated: {}) -> {}",
            file_names[0], bucket_region, accelerated, target.file_path
        );
        Ok(target)
    }
}
