use tokio::select;
use tokio::signal::unix;
use tokio::signal::unix::SignalKind;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, prelude::*};

use quill_p2p::common::peer::MemoryRepository;
use quill_p2p::common::time::SystemClock;
use quill_p2p::NetworkManager;

use crate::{cli::arguments, config::NodeConfig, controller::NodeController};

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let config = NodeConfig::from_path(args.config)?;

    let level: LevelFilter = config.logger.level.parse()?;
    let filter = Targets::new()
        .with_target("p2p", level)
        .with_target("net", level)
        .with_target("quilld", level)
        .with_default(level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init()?;

    let network = config.network;
    let manager = NetworkManager::start(
        config.p2p.to_core_config(network),
        MemoryRepository::new(),
        NodeController::new(),
        SystemClock,
    )?;

    let mut sigterm =
        unix::signal(SignalKind::terminate()).expect("SIGTERM handler can be installed");
    let mut sigint =
        unix::signal(SignalKind::interrupt()).expect("SIGINT handler can be installed");

    select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT signal");
        }
    }

    manager.shutdown();

    Ok(())
}
