use thiserror::Error;

/// Failure while obtaining a pre-signed upload target.
#[derive(Error, Debug)]
pub enum PresignError {
    #[error("presign request needs at least one file name")]
    NoFiles,

    /// The presign endpoint could not be reached or timed out.
    #[error("presign endpoint unreachable: {0}")]
    Unreachable(String),

    /// The presign endpoint answered with a non-success status.
    #[error("presign endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not carry the expected URL/path fields.
    #[error("malformed presign response: {0}")]
    Malformed(String),
}

/// Failure while moving bytes to or from a storage endpoint.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("invalid transfer url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Connection failure, broken body stream or timeout.
    #[error("network failure: {0}")]
    Network(String),

    #[error("storage endpoint returned status {status}")]
    Status { status: u16 },

    /// The downloaded payload could not be written locally.
    #[error("failed to save {path}: {source}")]
    Save {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while posting a stats record. Never fatal to a transfer.
#[derive(Error, Debug)]
pub enum ReportingError {
    #[error("stats endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("stats endpoint returned status {0}")]
    Status(u16),

    #[error("failed to encode stats record: {0}")]
    Encode(String),

    /// The dispatch worker is gone and cannot accept records.
    #[error("stats dispatcher closed")]
    Closed,
}

/// Error surfaced to callers of the transfer controller.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Another attempt is still in flight on this controller.
    #[error("a transfer is already in progress")]
    Busy,

    #[error("presign phase failed: {0}")]
    Presign(#[from] PresignError),

    #[error("transfer phase failed: {0}")]
    Transfer(#[from] TransferError),

    /// Bad caller input (unknown region, empty file list, unreadable file).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ProbeError {
    /// Name of the phase that produced the error.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Presign(_) => "presigning",
            Self::Transfer(_) => "transferring",
            Self::InvalidInput(_) => "input",
        }
    }
}
