//! Gossip transport for the price feed network.
//!
//! A [`Node`] drives a libp2p swarm (gossipsub, identify, ping and optional
//! Kademlia discovery) behind a control channel. Each joined topic gets a
//! [`Subscription`] whose inbound messages go through the rate limiter, the
//! topic decoder and the [`ValidatorChain`] before being delivered.

pub use bytes::Bytes;
pub use libp2p::gossipsub::MessageId;
pub use libp2p::identity::Keypair;
pub use libp2p::{Multiaddr, PeerId};

pub mod behaviour;
pub mod conn_gate;
pub mod events;
pub mod observers;
pub mod rate_limit;
pub mod scoring;
pub mod transport;
pub mod validation;

mod error;
mod message;
mod node;
mod subscription;
mod swarm;

pub use conn_gate::Blocklist;
pub use error::{BoxError, Error};
pub use events::{
    ConnectionNotifee, EventHandler, LifecycleEvent, MessageHandler, PeerEvent, PeerEventHandler,
    Registries,
};
pub use message::{AsAny, Message, Messages, RawMessage, ReceivedMessage};
pub use node::{split_peer_id, Node, NodeBuilder};
pub use rate_limit::RateLimiter;
pub use subscription::{Publisher, Subscription, SubscriptionState};
pub use transport::{P2pTransport, Transport};
pub use validation::{ValidationResult, Validator, ValidatorChain};
