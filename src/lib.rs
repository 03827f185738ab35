//! Object-storage transfer latency probe.
//!
//! Requests a pre-signed upload URL, streams a file up to a bucket region or
//! down from it, and reports timing statistics to a collection endpoint.

pub mod client;
pub mod common;
pub mod controller;
pub mod error;
pub mod message;
pub mod presign;
pub mod server;
pub mod stats;
pub mod transfer;

pub use common::{BucketRegion, ProbeConfig, TimeoutOptions, UploadPreset};
pub use controller::{ControllerStatus, Phase, TransferController, UploadFile};
pub use error::{PresignError, ProbeError, ReportingError, TransferError};
pub use message::{Operation, PresignedTarget, StatsRecord, TransferProgress};
