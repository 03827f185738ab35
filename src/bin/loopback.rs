use std::{net::SocketAddr, process::ExitCode, time::Duration};

use clap::Parser;
use storage_latency_probe::server::LoopbackServer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Serve local presign, storage and stats endpoints for offline runs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8990")]
    addr: SocketAddr,

    /// Artificial delay before storage requests are answered, in milliseconds
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// Size of the `file.mp4` object served for downloads, in bytes
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    object_size: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_env_filter(filter).finish(),
    ) {
        eprintln!("Failed to set tracing subscriber: {}", err);
    }

    let cli = Cli::parse();
    let mut server = LoopbackServer::new();
    server.set_latency(Duration::from_millis(cli.latency_ms));
    server.put_object("file.mp4", vec![0u8; cli.object_size]);

    let addr = match server.listen(cli.addr).await {
        Ok(addr) => addr,
        Err(err) => {
            error!("Failed to listen on {}: {}", cli.addr, err);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Try: probe --base-url http://{} download --url http://{}/objects/file.mp4",
        addr, addr
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for ctrl-c: {}", err);
    }
    for record in server.stats_records() {
        info!(
            "Collected {} {} in {} ms",
            record.operation, record.file_name, record.duration_ms
        );
    }
    server.stop().await;
    ExitCode::SUCCESS
}
