use std::path::PathBuf;

use clap::Parser;
use gridvale::FileConfig;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridvale", about = "Authoritative server for a tile-based multiplayer RPG")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "gridvale.toml")]
    config: PathBuf,

    /// Override the maps directory from the configuration.
    #[arg(long)]
    maps: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = if args.config.exists() {
        FileConfig::load(&args.config)?
    } else {
        info!(path = %args.config.display(), "no config file; using defaults");
        let mut config = FileConfig::default();
        config.apply_env();
        config
    };
    if let Some(maps) = args.maps {
        config.map.directory = maps;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });

        gridvale::run(config, shutdown_rx).await
    })
}
