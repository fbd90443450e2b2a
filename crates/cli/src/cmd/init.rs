//! Init command

use std::fs;
use std::path::Path;

use clap::Parser;
use color_eyre::eyre::{eyre, Context, Result};
use tracing::{info, warn};

use pricefeed_config::{Config, DiscoveryConfig, LoggingConfig, P2pConfig, TransportProtocol};
use pricefeed_oracle::Signer;

#[derive(Parser, Debug, Clone, Default, PartialEq)]
pub struct InitCmd {
    /// Overwrite existing configuration files
    #[clap(long)]
    pub overwrite: bool,

    /// Enable peer discovery.
    /// If enabled, the node will attempt to discover other nodes in the network
    #[clap(long, default_value = "false")]
    pub enable_discovery: bool,

    /// Port to listen on
    #[clap(long, default_value = "8000")]
    pub port: usize,

    /// Also generate a signing key, making this node a feeder
    #[clap(long)]
    pub feeder: bool,
}

impl InitCmd {
    /// Execute the init command
    pub fn run(&self, config_file: &Path, key_file: &Path, logging: LoggingConfig) -> Result<()> {
        let config = Config {
            moniker: "pricefeed-0".to_string(),
            p2p: P2pConfig {
                listen_addrs: vec![TransportProtocol::Tcp.multiaddr("0.0.0.0", self.port)],
                discovery: DiscoveryConfig {
                    enabled: self.enable_discovery,
                    ..DiscoveryConfig::default()
                },
                ..P2pConfig::default()
            },
            logging,
            ..Config::default()
        };

        if config_file.exists() && !self.overwrite {
            warn!(file = ?config_file.display(), "Configuration file already exists, skipping");
        } else {
            info!(file = ?config_file, "Saving configuration");
            save_config(config_file, &config)?;
        }

        if !self.feeder {
            return Ok(());
        }

        if key_file.exists() && !self.overwrite {
            warn!(file = ?key_file.display(), "Key file already exists, skipping");
        } else {
            create_parent_dir(key_file)?;

            let signer = Signer::random();
            signer.write_file(key_file)?;
            info!(file = ?key_file, address = %signer.address(), "Saved signing key");
        }

        Ok(())
    }
}

fn create_parent_dir(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| eyre!("Error creating parent directory {}", parent.display()))?;
    }

    Ok(())
}

/// Save configuration to file
pub fn save_config(config_file: &Path, config: &Config) -> Result<()> {
    create_parent_dir(config_file)?;

    let contents = toml::to_string_pretty(config)?;
    fs::write(config_file, contents)
        .wrap_err_with(|| eyre!("Error writing file {}", config_file.display()))
}
