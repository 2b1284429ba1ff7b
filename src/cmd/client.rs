use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// govpn client: derives its signing key from a passphrase and drives a
/// point-to-point session against a single remote `govpn-server`.
#[derive(Parser, Debug)]
#[command(name = "govpn-client", version, about)]
struct Args {
    /// Path to the client's TOML configuration file.
    #[arg(short, long, default_value = "govpn-client.toml")]
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
    if let Err(e) = govpn_rs::client::run(&args.config)
        .await
        .map_err(anyhow::Error::from)
        .with_context(|| format!("client failed using config {}", args.config.display()))
    {
        tracing::error!(error = %format!("{e:#}"), "client exited");
        std::process::exit(1);
    }
}
