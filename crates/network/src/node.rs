use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ipnet::IpNet;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use pricefeed_config::{P2pConfig, RateLimitConfig, ScoringConfig};
use pricefeed_metrics::SharedRegistry;

use crate::conn_gate::Blocklist;
use crate::error::Error;
use crate::events::{
    ConnectionNotifee, EventHandler, LifecycleEvent, MessageHandler, PeerEventHandler, Registries,
};
use crate::message::{decoder, Message, Messages};
use crate::observers;
use crate::rate_limit::RateLimiter;
use crate::scoring;
use crate::subscription::{self, Publisher, Subscription};
use crate::swarm::{self, CtrlMsg, Setup};
use crate::validation::Validator;

/// Split the trailing `/p2p/<peer id>` component off an address.
pub fn split_peer_id(addr: &Multiaddr) -> Result<(PeerId, Multiaddr), Error> {
    let mut addr = addr.clone();

    match addr.pop() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, addr)),
        Some(protocol) => {
            addr.push(protocol);
            Err(Error::MissingPeerId(addr))
        }
        None => Err(Error::MissingPeerId(addr)),
    }
}

/// Configures a [`Node`].
///
/// Settings are recorded in call order and validated by [`NodeBuilder::build`],
/// which performs no I/O.
pub struct NodeBuilder {
    keypair: Keypair,
    config: P2pConfig,
    pubsub: bool,
    default_observers: bool,
    registry: Option<SharedRegistry>,
    registries: Registries,
}

impl NodeBuilder {
    fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            config: P2pConfig::default(),
            pubsub: true,
            default_observers: true,
            registry: None,
            registries: Registries::default(),
        }
    }

    /// Replace the whole P2P configuration.
    pub fn config(mut self, config: P2pConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listen_addr(mut self, addr: Multiaddr) -> Self {
        self.config.listen_addrs.push(addr);
        self
    }

    /// A discovery seed, the address must end with `/p2p/<peer id>`.
    pub fn bootstrap_addr(mut self, addr: Multiaddr) -> Self {
        self.config.bootstrap_addrs.push(addr);
        self
    }

    /// A peer to stay connected to, the address must end with `/p2p/<peer id>`.
    pub fn direct_peer(mut self, addr: Multiaddr) -> Self {
        self.config.direct_peers.push(addr);
        self
    }

    pub fn block_network(mut self, network: IpNet) -> Self {
        self.config.blocked_addrs.push(network);
        self
    }

    pub fn block_peer(mut self, peer: impl ToString) -> Self {
        self.config.blocked_peers.push(peer.to_string());
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    pub fn scoring(mut self, config: ScoringConfig) -> Self {
        self.config.scoring = config;
        self
    }

    pub fn discovery(mut self, enabled: bool) -> Self {
        self.config.discovery.enabled = enabled;
        self
    }

    pub fn disable_pubsub(mut self) -> Self {
        self.pubsub = false;
        self
    }

    /// Do not register the built-in loggers and monitor.
    pub fn without_default_observers(mut self) -> Self {
        self.default_observers = false;
        self
    }

    /// Registry for libp2p metrics and the message monitor.
    pub fn metrics(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn event_handler(self, handler: Arc<dyn EventHandler>) -> Self {
        self.registries.events.add(handler);
        self
    }

    pub fn connection_notifee(self, notifee: Arc<dyn ConnectionNotifee>) -> Self {
        self.registries.connections.add(notifee);
        self
    }

    pub fn peer_event_handler(self, handler: Arc<dyn PeerEventHandler>) -> Self {
        self.registries.peer_events.add(handler);
        self
    }

    pub fn message_handler(self, handler: Arc<dyn MessageHandler>) -> Self {
        self.registries.messages.add(handler);
        self
    }

    pub fn validator(self, validator: Arc<dyn Validator>) -> Self {
        self.registries.validators.add(validator);
        self
    }

    pub fn build(self) -> Result<Node, Error> {
        let config = self.config;

        if config.pubsub_max_size.as_u64() == 0 {
            return Err(Error::InvalidConfig(
                "pubsub_max_size must be positive".to_string(),
            ));
        }

        if config.direct_connect_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "direct_connect_interval must be positive".to_string(),
            ));
        }

        let bootstrap_peers = config
            .bootstrap_addrs
            .iter()
            .map(split_peer_id)
            .collect::<Result<Vec<_>, _>>()?;

        let direct_peers = config
            .direct_peers
            .iter()
            .map(split_peer_id)
            .collect::<Result<Vec<_>, _>>()?;

        let blocked_peers = config
            .blocked_peers
            .iter()
            .map(|peer| {
                peer.parse::<PeerId>()
                    .map_err(|e| Error::InvalidPeerId(format!("{peer}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let rate_limiter = if config.rate_limit.enabled {
            Some(Arc::new(RateLimiter::from_config(&config.rate_limit)?))
        } else {
            None
        };

        if config.scoring.enabled {
            let topic = libp2p::gossipsub::IdentTopic::new("validate").hash();
            scoring::peer_score_params(&config.scoring, [topic])
                .validate()
                .map_err(|e| Error::InvalidConfig(format!("peer scoring: {e}")))?;
            scoring::peer_score_thresholds(&config.scoring)
                .validate()
                .map_err(|e| Error::InvalidConfig(format!("peer score thresholds: {e}")))?;
        }

        let registries = Arc::new(self.registries);
        if self.default_observers {
            observers::register_defaults(&registries, self.registry.as_ref());
        }

        let registry = self
            .registry
            .unwrap_or_else(|| SharedRegistry::global().clone());

        let node = Node {
            peer_id: self.keypair.public().to_peer_id(),
            keypair: self.keypair,
            blocklist: Blocklist::new(config.blocked_addrs.clone(), blocked_peers),
            config,
            bootstrap_peers,
            direct_peers,
            pubsub: self.pubsub,
            rate_limiter,
            registry,
            registries,
            token: CancellationToken::new(),
            state: Mutex::new(NodeState::Created),
            subscriptions: Mutex::new(HashMap::new()),
        };

        node.registries.emit(LifecycleEvent::Configured);

        Ok(node)
    }
}

enum NodeState {
    Created,
    /// Between the first `start` call and the swarm task being up
    Starting,
    Running {
        ctrl: mpsc::Sender<CtrlMsg>,
        task: JoinHandle<()>,
        sweeper: Option<JoinHandle<()>>,
    },
    Closed,
}

/// A peer in the gossip network.
///
/// Owns the libp2p swarm task, the observer sets and one [`Subscription`] per topic.
pub struct Node {
    keypair: Keypair,
    peer_id: PeerId,
    config: P2pConfig,
    bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    direct_peers: Vec<(PeerId, Multiaddr)>,
    blocklist: Blocklist,
    pubsub: bool,
    rate_limiter: Option<Arc<RateLimiter>>,
    registry: SharedRegistry,
    registries: Arc<Registries>,
    token: CancellationToken,
    state: Mutex<NodeState>,
    /// `None` while the topic is being joined
    subscriptions: Mutex<HashMap<String, Option<Subscription>>>,
}

impl Node {
    pub fn builder(keypair: Keypair) -> NodeBuilder {
        NodeBuilder::new(keypair)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().expect("poisoned lock"),
            NodeState::Running { .. }
        )
    }

    /// Start the swarm: listen, join pub-sub, dial bootstrap and direct peers.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().expect("poisoned lock");

            match *state {
                NodeState::Created => *state = NodeState::Starting,
                NodeState::Starting | NodeState::Running { .. } => {
                    return Err(Error::AlreadyStarted)
                }
                NodeState::Closed => return Err(Error::Closed),
            }
        }

        self.registries.emit(LifecycleEvent::Starting);

        let setup = Setup {
            config: self.config.clone(),
            bootstrap_peers: self.bootstrap_peers.clone(),
            direct_peers: self.direct_peers.clone(),
            blocklist: self.blocklist.clone(),
            pubsub: self.pubsub,
            registries: Arc::clone(&self.registries),
        };

        let spawned = swarm::spawn(&self.keypair, setup, &self.registry, || {
            self.registries.emit(LifecycleEvent::HostStarted)
        });

        let (ctrl, task) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                *self.state.lock().expect("poisoned lock") = NodeState::Closed;
                self.token.cancel();
                return Err(Error::Start(e.into()));
            }
        };

        if self.pubsub {
            self.registries.emit(LifecycleEvent::PubSubStarted);
        }

        let sweeper = self
            .rate_limiter
            .clone()
            .map(|limiter| limiter.spawn_sweeper(self.token.child_token()));

        let stopped = {
            let mut state = self.state.lock().expect("poisoned lock");
            match *state {
                NodeState::Starting => {
                    *state = NodeState::Running {
                        ctrl: ctrl.clone(),
                        task,
                        sweeper,
                    };
                    None
                }
                // Stopped while starting
                _ => Some((task, sweeper)),
            }
        };

        if let Some((task, sweeper)) = stopped {
            let _ = ctrl.send(CtrlMsg::Shutdown).await;
            let _ = task.await;
            self.token.cancel();
            if let Some(sweeper) = sweeper {
                let _ = sweeper.await;
            }
            return Err(Error::Closed);
        }

        self.registries.emit(LifecycleEvent::Started);

        Ok(())
    }

    /// Close every subscription, then shut the swarm down and wait for it.
    pub async fn stop(&self) -> Result<(), Error> {
        let previous = std::mem::replace(
            &mut *self.state.lock().expect("poisoned lock"),
            NodeState::Closed,
        );

        let (ctrl, task, sweeper) = match previous {
            NodeState::Closed => return Err(Error::Closed),
            NodeState::Created | NodeState::Starting => {
                self.token.cancel();
                return Ok(());
            }
            NodeState::Running {
                ctrl,
                task,
                sweeper,
            } => (ctrl, task, sweeper),
        };

        self.registries.emit(LifecycleEvent::Stopping);

        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .expect("poisoned lock")
            .drain()
            .filter_map(|(_, subscription)| subscription)
            .collect();

        for mut subscription in subscriptions {
            if let Err(e) = subscription.close().await {
                warn!(topic = %subscription.topic(), "Error closing subscription: {e}");
            }
        }

        if ctrl.send(CtrlMsg::Shutdown).await.is_err() {
            debug!("Network task already stopped");
        }

        if let Err(e) = task.await {
            error!("Network task failed: {e}");
        }

        self.token.cancel();

        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        self.registries.emit(LifecycleEvent::Stopped);

        Ok(())
    }

    fn ctrl(&self) -> Result<mpsc::Sender<CtrlMsg>, Error> {
        match &*self.state.lock().expect("poisoned lock") {
            NodeState::Created | NodeState::Starting => Err(Error::NotRunning),
            NodeState::Running { ctrl, .. } => Ok(ctrl.clone()),
            NodeState::Closed => Err(Error::Closed),
        }
    }

    /// Join `topic`, decoding its messages as `M`.
    pub async fn subscribe<M: Message + 'static>(&self, topic: impl Into<String>) -> Result<(), Error> {
        let topic = topic.into();

        if !self.pubsub {
            return Err(Error::PubSubDisabled);
        }

        let ctrl = self.ctrl()?;

        {
            let mut subscriptions = self.subscriptions.lock().expect("poisoned lock");
            if subscriptions.contains_key(&topic) {
                return Err(Error::AlreadySubscribed(topic));
            }

            subscriptions.insert(topic.clone(), None);
        }

        let ctx = subscription::Context {
            ctrl,
            registries: Arc::clone(&self.registries),
            rate_limiter: self.rate_limiter.clone(),
            token: self.token.child_token(),
        };

        let subscription = match Subscription::open(topic.clone(), decoder::<M>(), ctx).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.subscriptions
                    .lock()
                    .expect("poisoned lock")
                    .remove(&topic);

                return Err(e);
            }
        };

        let installed = {
            let mut subscriptions = self.subscriptions.lock().expect("poisoned lock");
            match subscriptions.get_mut(&topic) {
                Some(slot @ None) => {
                    *slot = Some(subscription);
                    None
                }
                // The node was stopped while we were joining
                _ => Some(subscription),
            }
        };

        if let Some(mut subscription) = installed {
            let _ = subscription.close().await;
            return Err(Error::Closed);
        }

        self.registries
            .emit(LifecycleEvent::TopicSubscribed { topic });

        Ok(())
    }

    /// Leave `topic`, closing its subscription.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        let subscription = {
            let mut subscriptions = self.subscriptions.lock().expect("poisoned lock");
            match subscriptions.get(topic) {
                Some(Some(_)) => subscriptions.remove(topic).flatten(),
                _ => None,
            }
        };

        let Some(mut subscription) = subscription else {
            return Err(Error::NotSubscribed(topic.to_string()));
        };

        let result = subscription.close().await;

        self.registries.emit(LifecycleEvent::TopicUnsubscribed {
            topic: topic.to_string(),
        });

        result
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        matches!(
            self.subscriptions.lock().expect("poisoned lock").get(topic),
            Some(Some(_))
        )
    }

    fn with_subscription<A>(
        &self,
        topic: &str,
        f: impl FnOnce(&Subscription) -> A,
    ) -> Result<A, Error> {
        match self.subscriptions.lock().expect("poisoned lock").get(topic) {
            Some(Some(subscription)) => Ok(f(subscription)),
            _ => Err(Error::NotSubscribed(topic.to_string())),
        }
    }

    /// Messages accepted on `topic`.
    pub fn messages(&self, topic: &str) -> Result<Messages, Error> {
        self.with_subscription(topic, Subscription::messages)
    }

    pub fn publisher(&self, topic: &str) -> Result<Publisher, Error> {
        self.with_subscription(topic, Subscription::publisher)
    }

    /// Publish on a subscribed topic.
    pub async fn publish(&self, topic: &str, message: &dyn Message) -> Result<(), Error> {
        let publisher = self.publisher(topic)?;
        publisher.publish(message).await
    }

    /// Refuse any further dial to addresses in `network`.
    pub fn block_ip(&self, network: IpNet) {
        self.blocklist.block_ip(network);
    }

    /// Refuse any further dial to `peer`, and drop the current connections to it.
    pub fn block_peer(&self, peer: PeerId) {
        self.blocklist.block_peer(peer);

        if let Ok(ctrl) = self.ctrl() {
            if let Err(e) = ctrl.try_send(CtrlMsg::BlockPeer(peer)) {
                warn!(%peer, "Cannot disconnect from blocked peer: {e}");
            }
        }
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    async fn query<A>(&self, f: impl FnOnce(oneshot::Sender<A>) -> CtrlMsg) -> Result<A, Error> {
        let ctrl = self.ctrl()?;
        let (reply, rx) = oneshot::channel();

        ctrl.send(f(reply)).await.map_err(|_| Error::TaskGone)?;
        rx.await.map_err(|_| Error::TaskGone)
    }

    /// Currently connected peers.
    pub async fn peers(&self) -> Result<Vec<PeerId>, Error> {
        self.query(CtrlMsg::Peers).await
    }

    /// Connected peers subscribed to `topic`.
    pub async fn topic_peers(&self, topic: &str) -> Result<Vec<PeerId>, Error> {
        let topic = topic.to_string();
        self.query(|reply| CtrlMsg::TopicPeers(topic, reply)).await
    }

    /// Gossipsub score of `peer`, if scoring is enabled and the peer is known.
    pub async fn peer_score(&self, peer: PeerId) -> Result<Option<f64>, Error> {
        self.query(|reply| CtrlMsg::PeerScore(peer, reply)).await
    }

    /// Addresses the node is actually listening on.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, Error> {
        self.query(CtrlMsg::ListenAddrs).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
