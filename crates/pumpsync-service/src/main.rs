//! pumpsync service - polls the pump and stores its status.
//!
//! Run with: `cargo run -p pumpsync-service -- --once`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pumpsync_core::{SyncContext, SyncOrchestrator};
use pumpsync_service::{
    Collector, Config, LogNotifier, LogUploadDispatcher, ReplayDeviceLink, TokioWakeScheduler,
};
use pumpsync_store::Store;

/// pumpsync service - background pump sync.
#[derive(Parser, Debug)]
#[command(name = "pumpsync-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Bridge recording to replay (overrides config).
    #[arg(short, long)]
    replay: Option<PathBuf>,

    /// Run a single sync cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pumpsync_service=info".parse()?)
                .add_directive("pumpsync_core=info".parse()?)
                .add_directive("pumpsync=info".parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    if let Some(replay) = args.replay {
        config.device.replay = Some(replay);
    }
    config.validate()?;

    let replay = config
        .device
        .replay
        .clone()
        .context("no bridge configured: set [device] replay or pass --replay")?;

    let settings = config.sync_settings();
    settings.validate()?;

    let store = Store::open(&config.storage.path)?;
    let orchestrator = SyncOrchestrator::new(
        ReplayDeviceLink::new(replay),
        store,
        TokioWakeScheduler::new(),
        SyncContext::new(settings),
    );

    let mut collector = Collector::new(orchestrator);
    let uploader = Arc::new(LogUploadDispatcher::new());
    let forwarder = collector.spawn_forwarder(Arc::new(LogNotifier), Arc::clone(&uploader));

    if args.once {
        collector.run_once().await;
    } else {
        let stop = CancellationToken::new();
        tokio::spawn({
            let stop = stop.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                }
                stop.cancel();
            }
        });
        collector.run(stop).await;
    }

    // Dropping the collector closes the event channel and ends the forwarder.
    drop(collector);
    forwarder.await?;
    uploader.drain().await;

    Ok(())
}
