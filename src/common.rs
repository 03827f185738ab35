use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// Default presign endpoint of the latency test service.
pub const DEFAULT_PRESIGN_ENDPOINT: &str = "https://api.storyly.io/latencytest/presignedurl";
/// Default stats collection endpoint of the latency test service.
pub const DEFAULT_STATS_ENDPOINT: &str = "https://api.storyly.io/latencytest/stats";
/// Upload body chunk size, 64KB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Timeouts applied to every outbound call.
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
    /// Time allowed for a whole request/response exchange, body included.
    pub request_timeout: Duration,
    /// Idle pooled connections are closed after this.
    pub idle_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Runtime configuration of the probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub presign_endpoint: String,
    pub stats_endpoint: String,
    /// Where downloaded payloads are written.
    pub download_dir: PathBuf,
    /// Size of the chunks an upload body is split into.
    pub chunk_size: usize,
    pub timeouts: TimeoutOptions,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            presign_endpoint: DEFAULT_PRESIGN_ENDPOINT.to_string(),
            stats_endpoint: DEFAULT_STATS_ENDPOINT.to_string(),
            download_dir: PathBuf::from("."),
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeouts: TimeoutOptions::default(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let default = Self::default();

        let request_timeout = env::var("PROBE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(default.timeouts.request_timeout);

        Self {
            presign_endpoint: env::var("PROBE_PRESIGN_ENDPOINT")
                .unwrap_or(default.presign_endpoint),
            stats_endpoint: env::var("PROBE_STATS_ENDPOINT").unwrap_or(default.stats_endpoint),
            download_dir: env::var("PROBE_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.download_dir),
            chunk_size: env::var("PROBE_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|size: &usize| *size > 0)
                .unwrap_or(default.chunk_size),
            timeouts: TimeoutOptions {
                request_timeout,
                ..default.timeouts
            },
        }
    }

    /// Point the presign and stats endpoints at a single base URL.
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.presign_endpoint = format!("{}/presign", base);
        self.stats_endpoint = format!("{}/stats", base);
        self
    }
}

/// Recognized storage bucket regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketRegion {
    #[serde(rename = "us-east-1")]
    UsEast1,
    #[serde(rename = "us-east-2")]
    UsEast2,
    #[serde(rename = "us-west-1")]
    UsWest1,
    #[serde(rename = "us-west-2")]
    UsWest2,
    #[serde(rename = "ca-central-1")]
    CaCentral1,
    #[serde(rename = "sa-east-1")]
    SaEast1,
    #[serde(rename = "eu-west-1")]
    EuWest1,
    #[serde(rename = "eu-west-2")]
    EuWest2,
    #[serde(rename = "eu-west-3")]
    EuWest3,
    #[serde(rename = "eu-central-1")]
    EuCentral1,
    #[serde(rename = "eu-north-1")]
    EuNorth1,
    #[serde(rename = "eu-south-1")]
    EuSouth1,
    #[serde(rename = "me-south-1")]
    MeSouth1,
    #[serde(rename = "af-south-1")]
    AfSouth1,
    #[serde(rename = "ap-east-1")]
    ApEast1,
    #[serde(rename = "ap-south-1")]
    ApSouth1,
    #[serde(rename = "ap-northeast-1")]
    ApNortheast1,
    #[serde(rename = "ap-northeast-2")]
    ApNortheast2,
    #[serde(rename = "ap-northeast-3")]
    ApNortheast3,
    #[serde(rename = "ap-southeast-1")]
    ApSoutheast1,
    #[serde(rename = "ap-southeast-2")]
    ApSoutheast2,
    #[serde(rename = "ap-southeast-3")]
    ApSoutheast3,
}

impl BucketRegion {
    pub const ALL: [BucketRegion; 22] = [
        Self::UsEast1,
        Self::UsEast2,
        Self::UsWest1,
        Self::UsWest2,
        Self::CaCentral1,
        Self::SaEast1,
        Self::EuWest1,
        Self::EuWest2,
        Self::EuWest3,
        Self::EuCentral1,
        Self::EuNorth1,
        Self::EuSouth1,
        Self::MeSouth1,
        Self::AfSouth1,
        Self::ApEast1,
        Self::ApSouth1,
        Self::ApNortheast1,
        Self::ApNortheast2,
        Self::ApNortheast3,
        Self::ApSoutheast1,
        Self::ApSoutheast2,
        Self::ApSoutheast3,
    ];

    /// The region identifier, e.g. `eu-west-1`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsEast1 => "us-east-1",
            Self::UsEast2 => "us-east-2",
            Self::UsWest1 => "us-west-1",
            Self::UsWest2 => "us-west-2",
            Self::CaCentral1 => "ca-central-1",
            Self::SaEast1 => "sa-east-1",
            Self::EuWest1 => "eu-west-1",
            Self::EuWest2 => "eu-west-2",
            Self::EuWest3 => "eu-west-3",
            Self::EuCentral1 => "eu-central-1",
            Self::EuNorth1 => "eu-north-1",
            Self::EuSouth1 => "eu-south-1",
            Self::MeSouth1 => "me-south-1",
            Self::AfSouth1 => "af-south-1",
            Self::ApEast1 => "ap-east-1",
            Self::ApSouth1 => "ap-south-1",
            Self::ApNortheast1 => "ap-northeast-1",
            Self::ApNortheast2 => "ap-northeast-2",
            Self::ApNortheast3 => "ap-northeast-3",
            Self::ApSoutheast1 => "ap-southeast-1",
            Self::ApSoutheast2 => "ap-southeast-2",
            Self::ApSoutheast3 => "ap-southeast-3",
        }
    }

    /// Human readable location of the region.
    pub fn label(&self) -> &'static str {
        match self {
            Self::UsEast1 => "N. Virginia",
            Self::UsEast2 => "Ohio",
            Self::UsWest1 => "N. California",
            Self::UsWest2 => "Oregon",
            Self::CaCentral1 => "Canada",
            Self::SaEast1 => "Sao Paulo",
            Self::EuWest1 => "Ireland",
            Self::EuWest2 => "London",
            Self::EuWest3 => "Paris",
            Self::EuCentral1 => "Frankfurt",
            Self::EuNorth1 => "Stockholm",
            Self::EuSouth1 => "Milan",
            Self::MeSouth1 => "Bahrain",
            Self::AfSouth1 => "Cape Town",
            Self::ApEast1 => "Hong Kong",
            Self::ApSouth1 => "Mumbai",
            Self::ApNortheast1 => "Tokyo",
            Self::ApNortheast2 => "Seoul",
            Self::ApNortheast3 => "Osaka",
            Self::ApSoutheast1 => "Singapore",
            Self::ApSoutheast2 => "Sydney",
            Self::ApSoutheast3 => "Indonesia",
        }
    }

    /// The static test object served from this region's bucket.
    pub fn download_url(&self) -> String {
        let region = self.as_str();
        format!(
            "https://prod-storyly-upload-test-{}.s3.{}.amazonaws.com/file.mp4",
            region, region
        )
    }
}

impl fmt::Display for BucketRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketRegion {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|region| region.as_str() == s)
            .ok_or_else(|| ProbeError::InvalidInput(format!("unknown bucket region: {}", s)))
    }
}

/// Upload targets offered by the latency test page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UploadPreset {
    /// eu-west-1, standard endpoint.
    Ireland,
    /// ap-southeast-3, standard endpoint.
    Indonesia,
    /// eu-west-1 through the accelerated edge endpoint.
    Edge,
}

impl UploadPreset {
    pub fn region(&self) -> BucketRegion {
        match self {
            Self::Ireland | Self::Edge => BucketRegion::EuWest1,
            Self::Indonesia => BucketRegion::ApSoutheast3,
        }
    }

    pub fn accelerated(&self) -> bool {
        matches!(self, Self::Edge)
    }
}

/// Source of wall-clock timestamps for stats records.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_epoch_ms(&self) -> u64;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_ms(&self) -> u64 {
        // Pre-epoch system clocks read as zero.
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_round_trips_through_identifier() {
        for region in BucketRegion::ALL {
            assert_eq!(region.as_str().parse::<BucketRegion>().unwrap(), region);
        }
    }

    #[test]
    fn test_unknown_region_is_rejected() {
        let err = "mars-north-1".parse::<BucketRegion>().unwrap_err();
        assert!(matches!(err, ProbeError::InvalidInput(_)));
    }

    #[test]
    fn test_region_serializes_as_identifier() {
        let json = serde_json::to_string(&BucketRegion::ApSoutheast3).unwrap();
        assert_eq!(json, "\"ap-southeast-3\"");
    }

    #[test]
    fn test_download_url() {
        assert_eq!(
            BucketRegion::EuWest1.download_url(),
            "https://prod-storyly-upload-test-eu-west-1.s3.eu-west-1.amazonaws.com/file.mp4"
        );
    }

    #[test]
    fn test_presets() {
        assert_eq!(UploadPreset::Ireland.region(), BucketRegion::EuWest1);
        assert!(!UploadPreset::Ireland.accelerated());
        assert_eq!(UploadPreset::Indonesia.region(), BucketRegion::ApSoutheast3);
        assert_eq!(UploadPreset::Edge.region(), BucketRegion::EuWest1);
        assert!(UploadPreset::Edge.accelerated());
    }

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.presign_endpoint, DEFAULT_PRESIGN_ENDPOINT);
        assert_eq!(config.stats_endpoint, DEFAULT_STATS_ENDPOINT);
        assert_eq!(config.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_with_base_url() {
        let config = ProbeConfig::default().with_base_url("http://127.0.0.1:9000/");
        assert_eq!(config.presign_endpoint, "http://127.0.0.1:9000/presign");
        assert_eq!(config.stats_endpoint, "http://127.0.0.1:9000/stats");
    }
}
