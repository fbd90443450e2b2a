use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, MessageId, PublishError, TopicHash, TopicScoreParams};
use libp2p::metrics::{Metrics, Recorder};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{self, DialError, SwarmEvent};
use libp2p::{identify, quic, Multiaddr, PeerId, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, error_span, info, trace, warn, Instrument};

use pricefeed_config::{P2pConfig, TransportProtocol};
use pricefeed_metrics::SharedRegistry;

use crate::behaviour::{Behaviour, NetworkEvent};
use crate::conn_gate::Blocklist;
use crate::error::Error;
use crate::events::{PeerEvent, Registries};
use crate::message::RawMessage;
use crate::scoring;
use crate::validation::ValidationResult;

const METRICS_PREFIX: &str = "pricefeed_libp2p";

/// Where the messages and peer events of a subscribed topic are routed to.
#[derive(Clone, Debug)]
pub(crate) struct Route {
    pub messages: mpsc::Sender<RawMessage>,
    pub peer_events: mpsc::Sender<PeerEvent>,
    /// Messages dropped because the subscription could not keep up
    pub lagged: Arc<AtomicU64>,
}

#[derive(Debug)]
pub(crate) enum CtrlMsg {
    Subscribe {
        topic: String,
        route: Route,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        data: Bytes,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    ReportValidation {
        message_id: MessageId,
        propagation_source: PeerId,
        result: ValidationResult,
    },
    BlockPeer(PeerId),
    Peers(oneshot::Sender<Vec<PeerId>>),
    TopicPeers(String, oneshot::Sender<Vec<PeerId>>),
    PeerScore(PeerId, oneshot::Sender<Option<f64>>),
    ListenAddrs(oneshot::Sender<Vec<Multiaddr>>),
    Shutdown,
}

/// Everything the swarm needs from the node to start.
pub(crate) struct Setup {
    pub config: P2pConfig,
    pub bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    pub direct_peers: Vec<(PeerId, Multiaddr)>,
    pub blocklist: Blocklist,
    pub pubsub: bool,
    pub registries: Arc<Registries>,
}

struct State {
    config: P2pConfig,
    local_peer_id: PeerId,
    direct_peers: Vec<(PeerId, Multiaddr)>,
    routes: HashMap<TopicHash, Route>,
    registries: Arc<Registries>,
}

fn apply_to_swarm(config: &P2pConfig, cfg: swarm::Config) -> swarm::Config {
    cfg.with_idle_connection_timeout(config.idle_connection_timeout)
}

fn apply_to_quic(mut cfg: quic::Config) -> quic::Config {
    // NOTE: This is set low due to quic transport not properly resetting
    // connection state when reconnecting before connection timeout.
    // See https://github.com/libp2p/rust-libp2p/issues/5097
    cfg.max_idle_timeout = 300;
    cfg.keep_alive_interval = Duration::from_millis(100);
    cfg
}

fn build(
    keypair: &libp2p::identity::Keypair,
    setup: &Setup,
    registry: &SharedRegistry,
) -> Result<swarm::Swarm<Behaviour>, eyre::Report> {
    let config = &setup.config;

    registry.with_prefix(METRICS_PREFIX, |registry| -> Result<_, eyre::Report> {
        let behaviour = Behaviour::new_with_metrics(
            config,
            keypair,
            setup.blocklist.clone(),
            setup.pubsub,
            registry,
        )?;

        let builder = SwarmBuilder::with_existing_identity(keypair.clone()).with_tokio();

        match config.transport {
            TransportProtocol::Tcp => Ok(builder
                .with_tcp(
                    libp2p::tcp::Config::new().nodelay(true), // Disable Nagle's algorithm
                    libp2p::noise::Config::new,
                    libp2p::yamux::Config::default,
                )?
                .with_dns()?
                .with_bandwidth_metrics(registry)
                .with_behaviour(|_| behaviour)?
                .with_swarm_config(|cfg| apply_to_swarm(config, cfg))
                .build()),

            TransportProtocol::Quic => Ok(builder
                .with_quic_config(apply_to_quic)
                .with_dns()?
                .with_bandwidth_metrics(registry)
                .with_behaviour(|_| behaviour)?
                .with_swarm_config(|cfg| apply_to_swarm(config, cfg))
                .build()),
        }
    })
}

/// Build the swarm, start listening and dialling, and spawn the task driving it.
///
/// `on_host_started` runs once the listeners are up, before pub-sub is configured.
pub(crate) fn spawn(
    keypair: &libp2p::identity::Keypair,
    setup: Setup,
    registry: &SharedRegistry,
    on_host_started: impl FnOnce(),
) -> Result<(mpsc::Sender<CtrlMsg>, JoinHandle<()>), eyre::Report> {
    let mut swarm = build(keypair, &setup, registry)?;
    let metrics = registry.with_prefix(METRICS_PREFIX, Metrics::new);

    for addr in &setup.config.listen_addrs {
        swarm
            .listen_on(addr.clone())
            .map_err(|e| eyre::eyre!("error listening on {addr}: {e}"))?;
    }

    on_host_started();

    if let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() {
        for (peer_id, _) in &setup.direct_peers {
            gossipsub.add_explicit_peer(peer_id);
        }
    }

    if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
        for (peer_id, addr) in &setup.bootstrap_peers {
            kademlia.add_address(peer_id, addr.clone());
        }

        if let Err(e) = kademlia.bootstrap() {
            debug!("Cannot bootstrap discovery: {e}");
        }
    }

    for (peer_id, addr) in setup.bootstrap_peers.iter().chain(&setup.direct_peers) {
        dial(&mut swarm, *peer_id, addr.clone());
    }

    let (tx_ctrl, rx_ctrl) = mpsc::channel(64);

    let state = State {
        config: setup.config,
        local_peer_id: *swarm.local_peer_id(),
        direct_peers: setup.direct_peers,
        routes: HashMap::new(),
        registries: setup.registries,
    };

    let span = error_span!("network");
    info!(parent: span.clone(), peer_id = %state.local_peer_id, "Starting network service");

    let task_handle = tokio::spawn(run(metrics, state, swarm, rx_ctrl).instrument(span));

    Ok((tx_ctrl, task_handle))
}

fn dial(swarm: &mut swarm::Swarm<Behaviour>, peer_id: PeerId, addr: Multiaddr) {
    let opts = DialOpts::peer_id(peer_id)
        .addresses(vec![addr.clone()])
        .condition(PeerCondition::DisconnectedAndNotDialing)
        .build();

    match swarm.dial(opts) {
        Ok(()) => trace!(%peer_id, %addr, "Dialing peer"),
        Err(DialError::Denied { cause }) => debug!(%peer_id, %addr, "Dial denied: {cause}"),
        Err(DialError::DialPeerConditionFalse(_)) => (),
        Err(e) => warn!(%peer_id, %addr, "Error dialing peer: {e}"),
    }
}

async fn run(
    metrics: Metrics,
    mut state: State,
    mut swarm: swarm::Swarm<Behaviour>,
    mut rx_ctrl: mpsc::Receiver<CtrlMsg>,
) {
    let mut direct_connect = tokio::time::interval(state.config.direct_connect_interval);
    direct_connect.tick().await;

    loop {
        let result = tokio::select! {
            event = swarm.select_next_some() => {
                handle_swarm_event(event, &metrics, &mut swarm, &mut state)
            }

            _ = direct_connect.tick() => {
                redial_direct_peers(&mut swarm, &state);
                ControlFlow::Continue(())
            }

            ctrl = rx_ctrl.recv() => match ctrl {
                Some(ctrl) => handle_ctrl_msg(&mut swarm, &mut state, ctrl),
                None => ControlFlow::Break(()),
            }
        };

        match result {
            ControlFlow::Continue(()) => continue,
            ControlFlow::Break(()) => break,
        }
    }

    debug!("Network service stopped");
}

fn redial_direct_peers(swarm: &mut swarm::Swarm<Behaviour>, state: &State) {
    for (peer_id, addr) in &state.direct_peers {
        if !swarm.is_connected(peer_id) {
            debug!(%peer_id, %addr, "Reconnecting to direct peer");
            dial(swarm, *peer_id, addr.clone());
        }
    }
}

fn report(
    swarm: &mut swarm::Swarm<Behaviour>,
    id: &MessageId,
    source: &PeerId,
    result: ValidationResult,
) {
    let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() else {
        return;
    };

    if !gossipsub.report_message_validation_result(id, source, result.into()) {
        trace!(message_id = %id, "Message no longer in cache when reporting validation result");
    }
}

fn handle_ctrl_msg(
    swarm: &mut swarm::Swarm<Behaviour>,
    state: &mut State,
    msg: CtrlMsg,
) -> ControlFlow<()> {
    match msg {
        CtrlMsg::Subscribe {
            topic,
            route,
            reply,
        } => {
            let result = subscribe(swarm, state, &topic, route);
            if let Err(e) = &result {
                error!(%topic, "Error subscribing to topic: {e}");
            }

            let _ = reply.send(result);
        }

        CtrlMsg::Unsubscribe { topic, reply } => {
            let topic = IdentTopic::new(topic);
            state.routes.remove(&topic.hash());

            if let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() {
                let was_subscribed = gossipsub.unsubscribe(&topic);
                trace!(%topic, ?was_subscribed, "Left topic");
            }

            let _ = reply.send(());
        }

        CtrlMsg::Publish { topic, data, reply } => {
            let result = publish(swarm, state, &topic, data);
            if let Err(e) = &result {
                error!(%topic, "Error publishing message: {e}");
            }

            let _ = reply.send(result);
        }

        CtrlMsg::ReportValidation {
            message_id,
            propagation_source,
            result,
        } => {
            report(swarm, &message_id, &propagation_source, result);
        }

        CtrlMsg::BlockPeer(peer_id) => {
            if let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() {
                gossipsub.blacklist_peer(&peer_id);
            }

            if swarm.disconnect_peer_id(peer_id).is_ok() {
                debug!(%peer_id, "Disconnected from blocked peer");
            }
        }

        CtrlMsg::Peers(reply) => {
            let _ = reply.send(swarm.connected_peers().copied().collect());
        }

        CtrlMsg::TopicPeers(topic, reply) => {
            let hash = IdentTopic::new(topic).hash();
            let peers = swarm
                .behaviour()
                .gossipsub
                .as_ref()
                .map(|gossipsub| {
                    gossipsub
                        .all_peers()
                        .filter(|(_, topics)| topics.contains(&&hash))
                        .map(|(peer_id, _)| *peer_id)
                        .collect()
                })
                .unwrap_or_default();

            let _ = reply.send(peers);
        }

        CtrlMsg::PeerScore(peer_id, reply) => {
            let score = swarm
                .behaviour()
                .gossipsub
                .as_ref()
                .and_then(|gossipsub| gossipsub.peer_score(&peer_id));

            let _ = reply.send(score);
        }

        CtrlMsg::ListenAddrs(reply) => {
            let _ = reply.send(swarm.listeners().cloned().collect());
        }

        CtrlMsg::Shutdown => return ControlFlow::Break(()),
    }

    ControlFlow::Continue(())
}

fn subscribe(
    swarm: &mut swarm::Swarm<Behaviour>,
    state: &mut State,
    topic: &str,
    route: Route,
) -> Result<(), Error> {
    let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() else {
        return Err(Error::PubSubDisabled);
    };

    let topic = IdentTopic::new(topic);
    let params = state
        .config
        .scoring
        .enabled
        .then(|| scoring::topic_score_params(&state.config.scoring));

    join(gossipsub, &topic, params)?;
    state.routes.insert(topic.hash(), route);

    Ok(())
}

/// Join `topic` and set its score params, leaving it again if they cannot be set.
fn join(
    gossipsub: &mut gossipsub::Behaviour,
    topic: &IdentTopic,
    params: Option<TopicScoreParams>,
) -> Result<(), Error> {
    gossipsub
        .subscribe(topic)
        .map_err(|e| Error::Subscribe(e.to_string()))?;

    if let Some(params) = params {
        if let Err(e) = gossipsub.set_topic_params(topic.clone(), params) {
            gossipsub.unsubscribe(topic);
            return Err(Error::Subscribe(e.to_string()));
        }
    }

    Ok(())
}

fn publish(
    swarm: &mut swarm::Swarm<Behaviour>,
    state: &State,
    topic: &str,
    data: Bytes,
) -> Result<(), Error> {
    let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() else {
        return Err(Error::PubSubDisabled);
    };

    let ident = IdentTopic::new(topic);
    let size = data.len();

    match gossipsub.publish(ident.clone(), data.clone()) {
        Ok(message_id) => debug!(%topic, %message_id, size, "Published message"),
        Err(PublishError::NoPeersSubscribedToTopic) => {
            debug!(%topic, size, "Published message, no peers subscribed yet")
        }
        Err(e) => return Err(Error::Publish(e.to_string())),
    }

    // The router does not deliver our own messages back to us
    if let Some(route) = state.routes.get(&ident.hash()) {
        let raw = RawMessage {
            topic: topic.to_string(),
            data,
            source: state.local_peer_id,
            propagation_source: state.local_peer_id,
            message_id: None,
        };

        forward(route, raw);
    }

    Ok(())
}

/// Hand a message over to its subscription, without ever blocking the swarm.
pub(crate) fn forward(route: &Route, raw: RawMessage) -> bool {
    match route.messages.try_send(raw) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(raw)) => {
            route.lagged.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %raw.topic, "Subscription is lagging behind, dropping message");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn handle_swarm_event(
    event: SwarmEvent<NetworkEvent>,
    metrics: &Metrics,
    swarm: &mut swarm::Swarm<Behaviour>,
    state: &mut State,
) -> ControlFlow<()> {
    if let SwarmEvent::Behaviour(NetworkEvent::GossipSub(e)) = &event {
        metrics.record(e);
    } else if let SwarmEvent::Behaviour(NetworkEvent::Identify(e)) = &event {
        metrics.record(e.as_ref());
    } else if let SwarmEvent::Behaviour(NetworkEvent::Kademlia(e)) = &event {
        metrics.record(e);
    }

    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            debug!(%address, "Node is listening");

            state
                .registries
                .connections
                .for_each(|notifee| notifee.listen(&address));
        }

        SwarmEvent::ExpiredListenAddr { address, .. } => {
            state
                .registries
                .connections
                .for_each(|notifee| notifee.listen_close(&address));
        }

        SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id,
            endpoint,
            num_established,
            ..
        } => {
            trace!("Connected to {peer_id} with connection id {connection_id}");

            if num_established.get() == 1 {
                let addr = endpoint.get_remote_address();
                state
                    .registries
                    .connections
                    .for_each(|notifee| notifee.connected(&peer_id, addr));
            }
        }

        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => match error {
            DialError::Denied { cause } => debug!(?peer_id, "Dial denied: {cause}"),
            error => warn!(?peer_id, "Error dialing peer: {error}"),
        },

        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            cause,
            ..
        } => {
            if let Some(cause) = cause {
                debug!("Connection closed with {peer_id}, reason: {cause}");
            } else {
                debug!("Connection closed with {peer_id}, reason: unknown");
            }

            if num_established == 0 {
                state
                    .registries
                    .connections
                    .for_each(|notifee| notifee.disconnected(&peer_id));
            }
        }

        SwarmEvent::Behaviour(NetworkEvent::Identify(event)) => {
            if let identify::Event::Received { peer_id, info, .. } = *event {
                trace!(
                    "Received identity from {peer_id}: protocol={:?}",
                    info.protocol_version
                );

                if info.protocol_version != state.config.protocol_names.identify {
                    trace!(
                        "Peer {peer_id} is using incompatible protocol version: {:?}",
                        info.protocol_version
                    );

                    return ControlFlow::Continue(());
                }

                let kad_protocol = &state.config.protocol_names.discovery_kad;
                let supports_kad = info
                    .protocols
                    .iter()
                    .any(|p| AsRef::<str>::as_ref(p) == kad_protocol);

                if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                    if supports_kad {
                        for addr in info.listen_addrs {
                            kademlia.add_address(&peer_id, addr);
                        }
                    }
                }
            }
        }

        SwarmEvent::Behaviour(NetworkEvent::Ping(event)) => {
            match &event.result {
                Ok(rtt) => {
                    trace!("Received pong from {} in {rtt:?}", event.peer);
                }
                Err(e) => {
                    trace!("Received pong from {} with error: {e}", event.peer);
                }
            }

            // Record metric for round-trip time sending a ping and receiving a pong
            metrics.record(&event);
        }

        SwarmEvent::Behaviour(NetworkEvent::GossipSub(event)) => {
            handle_gossipsub_event(event, swarm, state);
        }

        SwarmEvent::Behaviour(NetworkEvent::Kademlia(event)) => {
            trace!("Discovery event: {event:?}");
        }

        swarm_event => {
            metrics.record(&swarm_event);
        }
    }

    ControlFlow::Continue(())
}

fn handle_gossipsub_event(
    event: gossipsub::Event,
    swarm: &mut swarm::Swarm<Behaviour>,
    state: &State,
) {
    match event {
        gossipsub::Event::Subscribed { peer_id, topic } => {
            trace!("Peer {peer_id} subscribed to {topic}");

            if let Some(route) = state.routes.get(&topic) {
                let _ = route.peer_events.try_send(PeerEvent::Joined(peer_id));
            }
        }

        gossipsub::Event::Unsubscribed { peer_id, topic } => {
            trace!("Peer {peer_id} unsubscribed from {topic}");

            if let Some(route) = state.routes.get(&topic) {
                let _ = route.peer_events.try_send(PeerEvent::Left(peer_id));
            }
        }

        gossipsub::Event::Message {
            propagation_source,
            message_id,
            message,
        } => {
            let Some(route) = state.routes.get(&message.topic) else {
                trace!(
                    "Received message {message_id} from {propagation_source} on unknown topic: {}",
                    message.topic
                );

                report(swarm, &message_id, &propagation_source, ValidationResult::Ignore);
                return;
            };

            trace!(
                "Received message {message_id} from {propagation_source} on topic {} of {} bytes",
                message.topic,
                message.data.len()
            );

            let raw = RawMessage {
                topic: message.topic.to_string(),
                data: Bytes::from(message.data),
                source: message.source.unwrap_or(propagation_source),
                propagation_source,
                message_id: Some(message_id.clone()),
            };

            if !forward(route, raw) {
                report(swarm, &message_id, &propagation_source, ValidationResult::Ignore);
            }
        }

        gossipsub::Event::SlowPeer {
            peer_id,
            failed_messages,
        } => {
            trace!(
                "Slow peer detected: {peer_id}, total failed messages: {}",
                failed_messages.total()
            );
        }

        gossipsub::Event::GossipsubNotSupported { peer_id } => {
            trace!("Peer does not support GossipSub: {peer_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use libp2p::gossipsub::MessageAuthenticity;
    use libp2p::identity::Keypair;

    use super::*;

    fn gossipsub() -> gossipsub::Behaviour {
        gossipsub::Behaviour::new(
            MessageAuthenticity::Signed(Keypair::generate_ed25519()),
            gossipsub::Config::default(),
        )
        .unwrap()
    }

    #[test]
    fn join_without_score_params() {
        let mut gossipsub = gossipsub();
        let topic = IdentTopic::new("prices");

        join(&mut gossipsub, &topic, None).unwrap();
        assert!(gossipsub.topics().any(|t| *t == topic.hash()));
    }

    #[test]
    fn failed_join_leaves_the_topic() {
        // Scoring is not activated on this router, so topic params are refused
        let mut gossipsub = gossipsub();
        let topic = IdentTopic::new("prices");

        let result = join(&mut gossipsub, &topic, Some(TopicScoreParams::default()));

        assert!(matches!(result, Err(Error::Subscribe(_))));
        assert_eq!(gossipsub.topics().count(), 0);
    }
}
