use std::path::PathBuf;

use clap::Parser;
use pillar_master::{
    common::{DEFAULT_LOG_LEVEL, KEY_LOG_LEVEL, RawConfig, Result},
    server::Server,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pillar-master")]
#[command(version, about = "Pillar metadata master", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "master.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let raw = RawConfig::from_file(&cli.config)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(raw.get(KEY_LOG_LEVEL).unwrap_or(DEFAULT_LOG_LEVEL))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("loading config from {}", cli.config.display());
    let server = match Server::start(&raw).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("master failed to start: {}", e);
            return Err(e);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received ctrl-c"),
        _ = terminate() => tracing::info!("received SIGTERM"),
        _ = server.sync() => tracing::warn!("master stopped on its own"),
    }
    server.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut s) => {
            s.recv().await;
        }
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
