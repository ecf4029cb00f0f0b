use std::path::PathBuf;

use config::Config;
use serde::Deserialize;

use quill_types::network::Network;

mod logger;
pub use logger::LoggerConfig;

mod p2p;
pub use p2p::P2pConfig;

#[derive(Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_network")]
    pub network: Network,

    #[serde(default)]
    pub p2p: P2pConfig,

    #[serde(default)]
    pub logger: LoggerConfig,
}

fn default_network() -> Network {
    Network::Mainnet
}

impl NodeConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
