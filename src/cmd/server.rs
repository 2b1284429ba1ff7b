use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// govpn server: accepts handshakes from configured peers and tunnels
/// Ethernet frames between them and the local TAP/TUN device.
#[derive(Parser, Debug)]
#[command(name = "govpn-server", version, about)]
struct Args {
    /// Path to the server's TOML configuration file.
    #[arg(short, long, default_value = "govpn-server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )
    .expect("failed to install global tracing subscriber");

    let args = Args::parse();
    if let Err(e) = govpn_rs::server::run(&args.config)
        .await
        .map_err(anyhow::Error::from)
        .with_context(|| format!("server failed using config {}", args.config.display()))
    {
        tracing::error!(error = %format!("{e:#}"), "server exited");
        std::process::exit(1);
    }
}
