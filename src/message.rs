use std::fmt;

use hyper::Uri;
use serde::{Deserialize, Serialize};

use crate::{common::BucketRegion, error::PresignError};

/// The Encode trait is used to encode a data structure into a request body.
pub trait Encode {
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error>;
}

/// The Decode trait is used to decode a response body into a data structure.
pub trait Decode {
    type Error;

    fn decode(buf: &[u8]) -> Result<Self, Self::Error>
    where
        Self: Sized;
}

/// Body of the presign request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignRequest {
    /// Names of the files to be uploaded.
    pub files: Vec<String>,
    /// Target bucket region.
    pub bucket_region: BucketRegion,
    /// Whether the accelerated edge endpoint should be signed.
    pub accelerated: bool,
}

impl Encode for PresignRequest {
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Decode for PresignRequest {
    type Error = serde_json::Error;

    fn decode(buf: &[u8]) -> Result<Self, Self::Error> {
        serde_json::from_slice(buf)
    }
}

/// Raw body of the presign response, `{"data": {"urls": [..], "file_paths": [..]}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresignResponse {
    pub data: PresignData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresignData {
    pub urls: Vec<String>,
    pub file_paths: Vec<String>,
}

impl Encode for PresignResponse {
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A writable upload URL together with the storage-assigned file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedTarget {
    /// Absolute URL the file is PUT to.
    pub upload_url: String,
    /// Opaque path the storage service assigned to the file.
    pub file_path: String,
}

impl Decode for PresignedTarget {
    type Error = PresignError;

    /// Validate a presign response body and pick its first URL/path pair.
    fn decode(buf: &[u8]) -> Result<Self, PresignError> {
        let resp: PresignResponse = serde_json::from_slice(buf)
            .map_err(|err| PresignError::Malformed(err.to_string()))?;

        let upload_url = resp
            .data
            .urls
            .into_iter()
            .next()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| PresignError::Malformed("missing data.urls[0]".to_string()))?;
        let file_path = resp
            .data
            .file_paths
            .into_iter()
            .next()
            .filter(|path| !path.is_empty())
            .ok_or_else(|| PresignError::Malformed("missing data.file_paths[0]".to_string()))?;

        let uri: Uri = upload_url
            .parse()
            .map_err(|err| PresignError::Malformed(format!("bad upload url: {}", err)))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(PresignError::Malformed(format!(
                "upload url is not absolute: {}",
                upload_url
            )));
        }

        Ok(PresignedTarget {
            upload_url,
            file_path,
        })
    }
}

/// The kind of transfer a stats record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Timing and size summary of one completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub bucket_region: BucketRegion,
    pub operation: Operation,
    /// Epoch milliseconds right before the transfer started.
    #[serde(rename = "start")]
    pub start_ms: u64,
    /// Epoch milliseconds right after the transfer resolved.
    #[serde(rename = "end")]
    pub end_ms: u64,
    /// Always `end_ms - start_ms`.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub file_size: u64,
    pub file_name: String,
    pub file_path: String,
}

impl StatsRecord {
    /// Build a record. An end timestamp earlier than the start is clamped so
    /// the duration never goes negative.
    pub fn new(
        bucket_region: BucketRegion,
        operation: Operation,
        start_ms: u64,
        end_ms: u64,
        file_size: u64,
        file_name: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        let end_ms = end_ms.max(start_ms);
        Self {
            bucket_region,
            operation,
            start_ms,
            end_ms,
            duration_ms: end_ms - start_ms,
            file_size,
            file_name: file_name.into(),
            file_path: file_path.into(),
        }
    }

    /// Mean throughput in MiB/s, `None` for zero-length durations.
    pub fn throughput_mib_per_sec(&self) -> Option<f64> {
        if self.duration_ms == 0 {
            return None;
        }
        let mib = self.file_size as f64 / (1024.0 * 1024.0);
        Some(mib / (self.duration_ms as f64 / 1000.0))
    }

    /// The file path shortened for display: paths longer than 60 characters
    /// keep their first 50 and last 10 characters.
    pub fn display_path(&self) -> String {
        let chars: Vec<char> = self.file_path.chars().collect();
        if chars.len() <= 60 {
            return self.file_path.clone();
        }
        let head: String = chars[..50].iter().collect();
        let tail: String = chars[chars.len() - 10..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

impl Encode for StatsRecord {
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Decode for StatsRecord {
    type Error = serde_json::Error;

    fn decode(buf: &[u8]) -> Result<Self, Self::Error> {
        serde_json::from_slice(buf)
    }
}

impl fmt::Display for StatsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bucket Region: {}", self.bucket_region)?;
        writeln!(f, "Operation: {}", self.operation)?;
        writeln!(f, "Start: {} ms", self.start_ms)?;
        writeln!(f, "End: {} ms", self.end_ms)?;
        writeln!(f, "Duration: {} ms", self.duration_ms)?;
        writeln!(f, "File Size: {} byte", self.file_size)?;
        writeln!(f, "File Name: {}", self.file_name)?;
        write!(f, "File Path: {}", self.display_path())
    }
}

/// Bytes moved so far in the current transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: u64,
    /// `None` when the size of the transfer is unknown.
    pub total: Option<u64>,
}

impl TransferProgress {
    pub fn new(transferred: u64, total: Option<u64>) -> Self {
        Self { transferred, total }
    }

    /// Completion percentage in `0..=100`, `None` when the total is unknown.
    pub fn percent(&self) -> Option<u8> {
        let total = self.total?;
        if total == 0 {
            return Some(100);
        }
        let pct = (self.transferred as f64 / total as f64 * 100.0).round();
        Some(pct.clamp(0.0, 100.0) as u8)
    }

    /// Whether every expected byte has been moved.
    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.transferred >= total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presign_request_wire_shape() {
        let req = PresignRequest {
            files: vec!["clip.mp4".to_string()],
            bucket_region: BucketRegion::EuWest1,
            accelerated: false,
        };
        let value: serde_json::Value = serde_json::from_slice(&req.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "files": ["clip.mp4"],
                "bucket_region": "eu-west-1",
                "accelerated": false,
            })
        );
    }

    #[test]
    fn test_presigned_target_takes_first_pair() {
        let body = br#"{"data":{
            "urls":["https://bucket/a?sig=1","https://bucket/b"],
            "file_paths":["/a","/b"]
        }}"#;
        let target = PresignedTarget::decode(body).unwrap();
        assert_eq!(target.upload_url, "https://bucket/a?sig=1");
        assert_eq!(target.file_path, "/a");
    }

    #[test]
    fn test_presigned_target_rejects_missing_fields() {
        let cases: [&[u8]; 5] = [
            br#"{}"#,
            br#"{"data":{"urls":[],"file_paths":["/a"]}}"#,
            br#"{"data":{"urls":["https://bucket/a"]}}"#,
            br#"{"data":{"urls":["https://bucket/a"],"file_paths":[""]}}"#,
            b"not json",
        ];
        for body in cases {
            let err = PresignedTarget::decode(body).unwrap_err();
            assert!(matches!(err, PresignError::Malformed(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_presigned_target_rejects_relative_url() {
        let body = br#"{"data":{"urls":["/bucket/a"],"file_paths":["/a"]}}"#;
        assert!(matches!(
            PresignedTarget::decode(body),
            Err(PresignError::Malformed(_))
        ));
    }

    #[test]
    fn test_stats_record_wire_names() {
        let record = StatsRecord::new(
            BucketRegion::EuWest1,
            Operation::Upload,
            1_000,
            3_000,
            1_048_576,
            "clip.mp4",
            "/clip.mp4",
        );
        let value: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "bucket_region": "eu-west-1",
                "operation": "upload",
                "start": 1000,
                "end": 3000,
                "duration": 2000,
                "file_size": 1048576,
                "file_name": "clip.mp4",
                "file_path": "/clip.mp4",
            })
        );
    }

    #[test]
    fn test_stats_record_duration_never_negative() {
        let record = StatsRecord::new(
            BucketRegion::EuWest1,
            Operation::Download,
            5_000,
            4_000,
            0,
            "f",
            "p",
        );
        assert_eq!(record.duration_ms, 0);
        assert_eq!(record.end_ms - record.start_ms, record.duration_ms);
    }

    #[test]
    fn test_display_path_shortens_long_paths() {
        let mut record =
            StatsRecord::new(BucketRegion::EuWest1, Operation::Upload, 0, 1, 0, "f", "/short");
        assert_eq!(record.display_path(), "/short");

        record.file_path = format!("{}{}", "a".repeat(55), "0123456789");
        assert_eq!(
            record.display_path(),
            format!("{}...0123456789", "a".repeat(50))
        );
    }

    #[test]
    fn test_throughput() {
        let record = StatsRecord::new(
            BucketRegion::EuWest1,
            Operation::Upload,
            0,
            2_000,
            4 * 1024 * 1024,
            "f",
            "p",
        );
        assert_eq!(record.throughput_mib_per_sec(), Some(2.0));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(TransferProgress::new(0, Some(200)).percent(), Some(0));
        assert_eq!(TransferProgress::new(1, Some(200)).percent(), Some(1));
        assert_eq!(TransferProgress::new(199, Some(200)).percent(), Some(100));
        assert_eq!(TransferProgress::new(500, Some(200)).percent(), Some(100));
        assert_eq!(TransferProgress::new(0, Some(0)).percent(), Some(100));
        assert_eq!(TransferProgress::new(42, None).percent(), None);
        assert!(!TransferProgress::new(42, None).is_complete());
        assert!(TransferProgress::new(200, Some(200)).is_complete());
    }
}
