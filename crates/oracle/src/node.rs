use std::sync::Arc;

use libp2p::identity::Keypair;
use libp2p::PeerId;
use tracing::{debug, info};

use pricefeed_config::{Config, P2pConfig};
use pricefeed_metrics::SharedRegistry;
use pricefeed_network::{Messages, Node, P2pTransport, Transport};

use crate::error::Error;
use crate::price::{Price, PriceMessage};
use crate::signer::{Address, Signer};
use crate::validators::{Authorization, Freshness};

/// Topic carrying price attestations.
pub const PRICE_TOPIC: &str = "price/v1";

/// Identity and allow-list of an oracle node.
#[derive(Clone, Debug, Default)]
pub struct Keys {
    /// Feeders sign prices with this key, relays have none
    pub signer: Option<Signer>,
    pub feeders: Vec<Address>,
}

impl Keys {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let signer = config
            .keys
            .key_file
            .as_deref()
            .map(Signer::from_file)
            .transpose()?;

        let feeders = config
            .feeders
            .iter()
            .map(|feeder| feeder.parse())
            .collect::<Result<Vec<Address>, _>>()?;

        Ok(Self { signer, feeders })
    }

    /// Network identity: the signing key when there is one, a fresh key otherwise.
    pub fn keypair(&self) -> Result<Keypair, Error> {
        match &self.signer {
            Some(signer) => signer.keypair(),
            None => Ok(Keypair::generate_secp256k1()),
        }
    }
}

/// A feeder or relay on the price network.
pub struct OracleNode {
    transport: P2pTransport,
    signer: Option<Signer>,
}

impl OracleNode {
    /// Build a node validating prices against `keys.feeders`.
    pub fn from_config(
        config: &P2pConfig,
        keys: Keys,
        registry: SharedRegistry,
    ) -> Result<Self, Error> {
        let node = Node::builder(keys.keypair()?)
            .config(config.clone())
            .metrics(registry)
            .validator(Arc::new(Authorization::new(keys.feeders.iter().copied())))
            .validator(Arc::new(Freshness::new()))
            .build()?;

        debug!(
            peer_id = %node.peer_id(),
            feeders = keys.feeders.len(),
            signer = ?keys.signer.as_ref().map(Signer::address),
            "Oracle node configured"
        );

        Ok(Self {
            transport: P2pTransport::new(node),
            signer: keys.signer,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.transport.node().peer_id()
    }

    pub fn address(&self) -> Option<Address> {
        self.signer.as_ref().map(Signer::address)
    }

    pub fn transport(&self) -> &P2pTransport {
        &self.transport
    }

    /// Start the node and join the price topic.
    pub async fn start(&self) -> Result<(), Error> {
        self.transport.start().await?;
        self.transport.subscribe::<PriceMessage>(PRICE_TOPIC).await?;

        info!(peer_id = %self.peer_id(), topic = PRICE_TOPIC, "Oracle node started");

        Ok(())
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.transport.stop().await?;
        Ok(())
    }

    /// Validated price messages.
    pub fn prices(&self) -> Result<Messages, Error> {
        Ok(self.transport.messages(PRICE_TOPIC)?)
    }

    /// Sign `price` with the feeder key and publish it.
    pub async fn broadcast(&self, mut price: Price) -> Result<(), Error> {
        let signer = self.signer.as_ref().ok_or(Error::MissingSigner)?;
        signer.sign(&mut price)?;

        debug!(pair = %price.wat, value = ?price.value(), age = price.age, "Broadcasting price");

        self.transport
            .broadcast(PRICE_TOPIC, &PriceMessage::new(price))
            .await?;

        Ok(())
    }
}
