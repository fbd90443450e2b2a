use std::path::Path;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use tracing::{info, warn, Instrument};

use pricefeed_config::Config;
use pricefeed_metrics::SharedRegistry;
use pricefeed_oracle::{Keys, OracleNode};

use crate::metrics;

#[derive(Parser, Debug, Clone, Default, PartialEq)]
pub struct StartCmd {
    /// Run as a relay even if a signing key is available
    #[clap(long)]
    relay: bool,
}

impl StartCmd {
    pub async fn run(&self, cfg: Config, default_key_file: &Path) -> Result<()> {
        let span = tracing::error_span!("node", moniker = %cfg.moniker);

        self.run_node(cfg, default_key_file).instrument(span).await
    }

    async fn run_node(&self, mut cfg: Config, default_key_file: &Path) -> Result<()> {
        let moniker = cfg.moniker.clone();

        if cfg.metrics.enabled {
            tokio::spawn(metrics::serve(cfg.metrics.clone()).in_current_span());
        }

        if cfg.keys.key_file.is_none() && default_key_file.exists() {
            cfg.keys.key_file = Some(default_key_file.to_path_buf());
        }

        let mut keys = Keys::from_config(&cfg)?;
        if self.relay {
            keys.signer = None;
        }

        match keys.signer.as_ref() {
            Some(signer) => info!(address = %signer.address(), "Starting feeder"),
            None => info!("Starting relay"),
        }

        if keys.feeders.is_empty() {
            warn!("No feeders configured, every price will be ignored");
        }

        let registry = SharedRegistry::global().with_moniker(&moniker);
        let node = OracleNode::from_config(&cfg.p2p, keys, registry)?;

        node.start().await?;
        info!(peer_id = %node.peer_id(), "Node is running");

        let prices = node.prices()?;

        loop {
            tokio::select! {
                received = prices.recv() => match received {
                    Some(received) => {
                        if let Some(error) = &received.error {
                            warn!("Price delivery problem: {error}");
                        }
                    }
                    None => break,
                },

                result = tokio::signal::ctrl_c() => {
                    result.map_err(|e| eyre!("cannot listen for shutdown signal: {e}"))?;
                    info!("Shutting down...");
                    break;
                }
            }
        }

        node.stop().await?;

        info!("Node has stopped");

        Ok(())
    }
}
