//! Outbound dial filtering.
//!
//! Consulted before every outbound dial. A dial to a blocked peer, or to an
//! address inside a blocked network, is denied. Inbound connections are always
//! allowed.
//!
//! Blocked networks and peers can be added at runtime, never removed.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use ipnet::IpNet;
use libp2p::core::transport::PortUse;
use libp2p::core::Endpoint;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{
    dummy, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandler,
    THandlerInEvent, THandlerOutEvent, ToSwarm,
};
use libp2p::{Multiaddr, PeerId};
use tracing::debug;

#[derive(Debug, Default)]
struct Filters {
    networks: Vec<IpNet>,
    peers: HashSet<PeerId>,
}

/// Shared, append-only deny list.
#[derive(Clone, Debug, Default)]
pub struct Blocklist {
    inner: Arc<RwLock<Filters>>,
}

impl Blocklist {
    pub fn new(networks: Vec<IpNet>, peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Filters {
                networks,
                peers: peers.into_iter().collect(),
            })),
        }
    }

    pub fn block_ip(&self, network: IpNet) {
        let mut filters = self.inner.write().expect("poisoned lock");
        if !filters.networks.contains(&network) {
            filters.networks.push(network);
        }
    }

    pub fn block_peer(&self, peer: PeerId) {
        self.inner.write().expect("poisoned lock").peers.insert(peer);
    }

    pub fn is_peer_blocked(&self, peer: &PeerId) -> bool {
        self.inner.read().expect("poisoned lock").peers.contains(peer)
    }

    pub fn is_ip_blocked(&self, ip: &IpAddr) -> bool {
        self.inner
            .read()
            .expect("poisoned lock")
            .networks
            .iter()
            .any(|net| net.contains(ip))
    }

    pub fn is_addr_blocked(&self, addr: &Multiaddr) -> bool {
        extract_ip(addr).is_some_and(|ip| self.is_ip_blocked(&ip))
    }
}

/// Behaviour enforcing the [`Blocklist`] on outbound dials.
pub struct Behaviour {
    blocklist: Blocklist,
}

impl Behaviour {
    pub fn new(blocklist: Blocklist) -> Self {
        Self { blocklist }
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }
}

impl NetworkBehaviour for Behaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_pending_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        maybe_peer: Option<PeerId>,
        addresses: &[Multiaddr],
        _effective_role: Endpoint,
    ) -> Result<Vec<Multiaddr>, ConnectionDenied> {
        if let Some(peer) = maybe_peer {
            if self.blocklist.is_peer_blocked(&peer) {
                debug!(%peer, "Denying dial to blocked peer");
                return Err(ConnectionDenied::new(Blocked::Peer(peer)));
            }
        }

        // The swarm keeps dialling the addresses it was given, so any
        // blocked address among them denies the whole dial.
        if let Some(addr) = addresses.iter().find(|a| self.blocklist.is_addr_blocked(a)) {
            debug!(%addr, "Denying dial to blocked address");
            return Err(ConnectionDenied::new(Blocked::Address(addr.clone())));
        }

        Ok(vec![])
    }

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        Ok(dummy::ConnectionHandler)
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        // Dials made without a known peer id are only checked here
        if self.blocklist.is_peer_blocked(&peer) {
            debug!(%peer, %addr, "Closing connection to blocked peer");
            return Err(ConnectionDenied::new(Blocked::Peer(peer)));
        }

        Ok(dummy::ConnectionHandler)
    }

    fn on_swarm_event(&mut self, _event: FromSwarm<'_>) {}

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(
        &mut self,
        _cx: &mut Context<'_>,
    ) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}

/// Reason a dial was denied.
#[derive(Debug, thiserror::Error)]
pub enum Blocked {
    #[error("peer {0} is blocked")]
    Peer(PeerId),

    #[error("address {0} is in a blocked network")]
    Address(Multiaddr),
}

fn extract_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}
