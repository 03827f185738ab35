use std::{
    io::Write,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::{Args, Parser, Subcommand};
use storage_latency_probe::{
    transfer::ProgressSink, BucketRegion, ProbeConfig, ProbeError, StatsRecord,
    TransferController, TransferProgress, UploadFile, UploadPreset,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Measure object-storage upload and download latency
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL serving /presign and /stats (overrides PROBE_* endpoints)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Directory downloaded files are written to
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file through a pre-signed URL
    Upload {
        /// File to upload
        file: PathBuf,

        /// Upload target preset (overrides --region/--accelerated)
        #[arg(long, value_enum)]
        preset: Option<UploadPreset>,

        /// Bucket region
        #[arg(long, default_value = "eu-west-1")]
        region: BucketRegion,

        /// Use the accelerated edge endpoint
        #[arg(long, default_value = "false")]
        accelerated: bool,

        /// Content type sent with the upload (detected when omitted)
        #[arg(long)]
        content_type: Option<String>,

        #[command(flatten)]
        rounds: Rounds,
    },
    /// Download a file from a bucket region
    Download {
        /// Object URL (defaults to the region's test object)
        #[arg(long)]
        url: Option<String>,

        /// Bucket region
        #[arg(long, default_value = "eu-west-1")]
        region: BucketRegion,

        #[command(flatten)]
        rounds: Rounds,
    },
    /// List recognized bucket regions
    Regions,
}

#[derive(Args, Debug)]
struct Rounds {
    /// Number of sequential attempts
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    rounds: u32,
}

/// Prints completion percentage to stderr whenever it changes.
#[derive(Default)]
struct PercentPrinter {
    last: Mutex<Option<u8>>,
}

impl ProgressSink for PercentPrinter {
    fn on_progress(&self, progress: TransferProgress) {
        let mut stderr = std::io::stderr();
        match progress.percent() {
            Some(pct) => {
                let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
                if *last != Some(pct) {
                    *last = Some(pct);
                    let _ = write!(stderr, "\r{:>3}%", pct);
                }
            }
            None => {
                let _ = write!(stderr, "\r{} bytes", progress.transferred);
            }
        }
        let _ = stderr.flush();
    }
}

fn print_summary(records: &[StatsRecord]) {
    let Some(first) = records.first() else {
        return;
    };
    if records.len() == 1 {
        println!("{}", first);
        if let Some(speed) = first.throughput_mib_per_sec() {
            println!("Throughput: {:.2} MiB/s", speed);
        }
        return;
    }

    let durations: Vec<u64> = records.iter().map(|r| r.duration_ms).collect();
    let min = durations.iter().min().copied().unwrap_or_default();
    let max = durations.iter().max().copied().unwrap_or_default();
    let mean = durations.iter().sum::<u64>() as f64 / durations.len() as f64;
    let speeds: Vec<f64> = records
        .iter()
        .filter_map(StatsRecord::throughput_mib_per_sec)
        .collect();

    println!(
        "{} {} rounds in {} ({} bytes each)",
        records.len(),
        first.operation,
        first.bucket_region,
        first.file_size
    );
    println!("Duration min/mean/max: {} / {:.1} / {} ms", min, mean, max);
    if !speeds.is_empty() {
        println!(
            "Mean throughput: {:.2} MiB/s",
            speeds.iter().sum::<f64>() / speeds.len() as f64
        );
    }
}

async fn run(cli: Cli) -> Result<(), ProbeError> {
    let mut config = ProbeConfig::from_env();
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(dir) = cli.download_dir {
        config.download_dir = dir;
    }

    let controller = TransferController::from_config(&config)
        .with_observer(Arc::new(PercentPrinter::default()));
    let mut records = Vec::new();

    match cli.command {
        Command::Upload {
            file,
            preset,
            region,
            accelerated,
            content_type,
            rounds,
        } => {
            let (region, accelerated) = match preset {
                Some(preset) => (preset.region(), preset.accelerated()),
                None => (region, accelerated),
            };
            let mut file = UploadFile::from_path(&file).await?;
            if let Some(content_type) = content_type {
                file = file.with_content_type(content_type);
            }
            for round in 1..=rounds.rounds {
                info!("Upload round {}/{}", round, rounds.rounds);
                let record = controller.upload(&file, region, accelerated).await;
                eprintln!();
                records.push(record?);
            }
        }
        Command::Download {
            url,
            region,
            rounds,
        } => {
            let url = url.unwrap_or_else(|| region.download_url());
            for round in 1..=rounds.rounds {
                info!("Download round {}/{}", round, rounds.rounds);
                let record = controller.download(&url, region).await;
                eprintln!();
                records.push(record?);
            }
        }
        Command::Regions => {
            for region in BucketRegion::ALL {
                println!("{:<16} {}", region.as_str(), region.label());
            }
            return Ok(());
        }
    }

    print_summary(&records);
    controller.stats().flush().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", err);
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
