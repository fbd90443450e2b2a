use std::convert::Infallible;
use std::time::Duration;

use eyre::Result;
use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::kad::Mode;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, kad, ping, StreamProtocol};

use pricefeed_config::{DiscoveryConfig, GossipSubConfig, P2pConfig};
use pricefeed_metrics::Registry;

use crate::conn_gate::{self, Blocklist};
use crate::scoring;

#[derive(Debug)]
pub enum NetworkEvent {
    Identify(Box<identify::Event>),
    Ping(ping::Event),
    GossipSub(gossipsub::Event),
    Kademlia(kad::Event),
}

impl From<identify::Event> for NetworkEvent {
    fn from(event: identify::Event) -> Self {
        Self::Identify(Box::new(event))
    }
}

impl From<ping::Event> for NetworkEvent {
    fn from(event: ping::Event) -> Self {
        Self::Ping(event)
    }
}

impl From<gossipsub::Event> for NetworkEvent {
    fn from(event: gossipsub::Event) -> Self {
        Self::GossipSub(event)
    }
}

impl From<kad::Event> for NetworkEvent {
    fn from(event: kad::Event) -> Self {
        Self::Kademlia(event)
    }
}

impl From<Infallible> for NetworkEvent {
    fn from(event: Infallible) -> Self {
        match event {}
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NetworkEvent")]
pub struct Behaviour {
    pub conn_gate: conn_gate::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub gossipsub: Toggle<gossipsub::Behaviour>,
    pub kademlia: Toggle<kad::Behaviour<MemoryStore>>,
}

/// Dummy implementation of Debug for Behaviour.
impl std::fmt::Debug for Behaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behaviour").finish()
    }
}

fn message_id(message: &gossipsub::Message) -> gossipsub::MessageId {
    use seahash::SeaHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = SeaHasher::new();
    message.hash(&mut hasher);
    gossipsub::MessageId::new(hasher.finish().to_be_bytes().as_slice())
}

fn gossipsub_config(
    config: GossipSubConfig,
    max_transmit_size: usize,
) -> Result<gossipsub::Config> {
    let config = gossipsub::ConfigBuilder::default()
        .max_transmit_size(max_transmit_size)
        .opportunistic_graft_ticks(3)
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .validate_messages()
        .history_gossip(3)
        .history_length(5)
        .mesh_n_high(config.mesh_n_high())
        .mesh_n_low(config.mesh_n_low())
        .mesh_outbound_min(config.mesh_outbound_min())
        .mesh_n(config.mesh_n())
        .message_id_fn(message_id)
        .build()?;

    Ok(config)
}

fn kademlia(
    keypair: &Keypair,
    config: DiscoveryConfig,
    protocol: String,
) -> Result<kad::Behaviour<MemoryStore>> {
    let mut kad_config = kad::Config::new(StreamProtocol::try_from_owned(protocol)?);
    kad_config.set_periodic_bootstrap_interval(Some(config.bootstrap_interval));

    let peer_id = keypair.public().to_peer_id();
    let mut kademlia =
        kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), kad_config);
    kademlia.set_mode(Some(Mode::Server));

    Ok(kademlia)
}

impl Behaviour {
    pub fn new_with_metrics(
        config: &P2pConfig,
        keypair: &Keypair,
        blocklist: Blocklist,
        pubsub: bool,
        registry: &mut Registry,
    ) -> Result<Self> {
        let identify = identify::Behaviour::new(identify::Config::new(
            config.protocol_names.identify.clone(),
            keypair.public(),
        ));

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(5)));

        let gossipsub = if pubsub {
            let mut gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(keypair.clone()),
                gossipsub_config(config.gossipsub, config.pubsub_max_size.as_u64() as usize)?,
            )
            .map_err(|e| eyre::eyre!(e))?
            .with_metrics(
                registry.sub_registry_with_prefix("gossipsub"),
                Default::default(),
            );

            if config.scoring.enabled {
                scoring::enable(&mut gossipsub, &config.scoring).map_err(|e| eyre::eyre!(e))?;
            }

            Some(gossipsub)
        } else {
            None
        };

        let kademlia = if config.discovery.enabled {
            Some(kademlia(
                keypair,
                config.discovery,
                config.protocol_names.discovery_kad.clone(),
            )?)
        } else {
            None
        };

        Ok(Self {
            conn_gate: conn_gate::Behaviour::new(blocklist),
            identify,
            ping,
            gossipsub: Toggle::from(gossipsub),
            kademlia: Toggle::from(kademlia),
        })
    }
}
