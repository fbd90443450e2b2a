use core::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pricefeed_config::{DiscoveryConfig, P2pConfig, TransportProtocol};
use pricefeed_metrics::SharedRegistry;
use pricefeed_network::{
    BoxError, EventHandler, Keypair, LifecycleEvent, Message, Multiaddr, Node, NodeBuilder, PeerId,
};
use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

//---------------------------------------------------------------------
// Messages
//---------------------------------------------------------------------

/// UTF-8 text payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Text(pub String);

impl Text {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl Message for Text {
    fn marshal_binary(&self) -> Result<Vec<u8>, BoxError> {
        Ok(self.0.as_bytes().to_vec())
    }

    fn unmarshal_binary(bytes: &[u8]) -> Result<Self, BoxError> {
        Ok(Self(String::from_utf8(bytes.to_vec())?))
    }
}

//---------------------------------------------------------------------
// Expected primitives
//---------------------------------------------------------------------

#[derive(Debug)]
pub enum Expected {
    Exactly(Vec<usize>),
    AtLeast(Vec<usize>),
}

impl Expected {
    pub fn is_met(&self, actual: &[usize]) -> bool {
        match self {
            Expected::Exactly(expected) => {
                actual.len() == expected.len() && expected.iter().all(|n| actual.contains(n))
            }
            Expected::AtLeast(expected) => expected.iter().all(|n| actual.contains(n)),
        }
    }

    pub fn check(&self, actual: &[usize]) {
        assert!(self.is_met(actual), "Expected {self}, got {actual:?}");
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Exactly(v) => write!(f, "exactly {v:?}"),
            Expected::AtLeast(v) => write!(f, "at least {v:?}"),
        }
    }
}

//---------------------------------------------------------------------
// Test node
//---------------------------------------------------------------------

type Configure = Box<dyn FnOnce(NodeBuilder) -> NodeBuilder>;

pub struct TestNode {
    direct_peers: Vec<usize>,
    bootstrap_nodes: Option<Vec<usize>>,
    blocked_peers: Vec<usize>,
    configure: Option<Configure>,
}

impl TestNode {
    /// A node keeping a direct connection to each of `direct_peers`.
    pub fn correct(direct_peers: Vec<usize>) -> Self {
        Self {
            direct_peers,
            bootstrap_nodes: None,
            blocked_peers: Vec::new(),
            configure: None,
        }
    }

    /// Enable discovery, seeded with the given nodes.
    pub fn discovering(mut self, bootstrap_nodes: Vec<usize>) -> Self {
        self.bootstrap_nodes = Some(bootstrap_nodes);
        self
    }

    /// Refuse to dial the given nodes.
    pub fn blocking(mut self, blocked_peers: Vec<usize>) -> Self {
        self.blocked_peers = blocked_peers;
        self
    }

    /// Additional builder settings, applied last.
    pub fn with(mut self, configure: impl FnOnce(NodeBuilder) -> NodeBuilder + 'static) -> Self {
        self.configure = Some(Box::new(configure));
        self
    }
}

//---------------------------------------------------------------------
// Test network
//---------------------------------------------------------------------

/// A set of started nodes listening on consecutive local TCP ports.
pub struct Network<const N: usize> {
    nodes: [Arc<Node>; N],
    peer_ids: [PeerId; N],
}

impl<const N: usize> Network<N> {
    pub async fn start(test_nodes: [TestNode; N]) -> Self {
        init_logging();
        info!("Starting network with {N} nodes");

        let base_port = random_base_port();
        let keypairs: [Keypair; N] = std::array::from_fn(|_| Keypair::generate_secp256k1());
        let peer_ids: [PeerId; N] = std::array::from_fn(|i| keypairs[i].public().to_peer_id());
        let addr = |i: usize| TransportProtocol::Tcp.multiaddr("127.0.0.1", base_port + i);

        let mut nodes = Vec::with_capacity(N);

        for (i, test_node) in test_nodes.into_iter().enumerate() {
            let config = P2pConfig {
                listen_addrs: vec![addr(i)],
                direct_peers: test_node
                    .direct_peers
                    .iter()
                    .map(|&j| with_peer_id(addr(j), peer_ids[j]))
                    .collect(),
                bootstrap_addrs: test_node
                    .bootstrap_nodes
                    .iter()
                    .flatten()
                    .map(|&j| with_peer_id(addr(j), peer_ids[j]))
                    .collect(),
                discovery: DiscoveryConfig {
                    enabled: test_node.bootstrap_nodes.is_some(),
                    ..DiscoveryConfig::default()
                },
                blocked_peers: test_node
                    .blocked_peers
                    .iter()
                    .map(|&j| peer_ids[j].to_string())
                    .collect(),
                transport: TransportProtocol::Tcp,
                direct_connect_interval: Duration::from_secs(1),
                ..P2pConfig::default()
            };

            let mut builder = Node::builder(keypairs[i].clone())
                .config(config)
                .metrics(SharedRegistry::global().with_moniker(format!("node-{i}")));

            if let Some(configure) = test_node.configure {
                builder = configure(builder);
            }

            let node = builder.build().unwrap();
            node.start().await.unwrap();
            debug!(id = %i, "Started node");

            nodes.push(Arc::new(node));
        }

        Self {
            nodes: nodes.try_into().unwrap_or_else(|_| unreachable!()),
            peer_ids,
        }
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    pub fn peer_id(&self, i: usize) -> PeerId {
        self.peer_ids[i]
    }

    pub fn index_of(&self, peer: &PeerId) -> Option<usize> {
        self.peer_ids.iter().position(|p| p == peer)
    }

    /// Indices of the nodes connected to node `i`.
    pub async fn peers_of(&self, i: usize) -> Vec<usize> {
        let peers = self.nodes[i].peers().await.unwrap();
        peers.iter().filter_map(|p| self.index_of(p)).collect()
    }

    /// Indices of the nodes subscribed to `topic`, as seen by node `i`.
    pub async fn topic_peers_of(&self, i: usize, topic: &str) -> Vec<usize> {
        let peers = self.nodes[i].topic_peers(topic).await.unwrap();
        peers.iter().filter_map(|p| self.index_of(p)).collect()
    }

    /// Poll node `i` until its connected peers match `expected`, or fail after `timeout`.
    pub async fn wait_for_peers(&self, i: usize, expected: Expected, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        loop {
            let actual = self.peers_of(i).await;
            if expected.is_met(&actual) {
                return;
            }

            if Instant::now() >= deadline {
                expected.check(&actual);
            }

            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Poll node `i` until the nodes in `expected` are subscribed to `topic`.
    pub async fn wait_for_topic_peers(
        &self,
        i: usize,
        topic: &str,
        expected: Expected,
        timeout: Duration,
    ) {
        let deadline = Instant::now() + timeout;

        loop {
            let actual = self.topic_peers_of(i, topic).await;
            if expected.is_met(&actual) {
                return;
            }

            if Instant::now() >= deadline {
                expected.check(&actual);
            }

            sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn stop(self) {
        for node in &self.nodes {
            node.stop().await.unwrap();
        }
    }
}

//---------------------------------------------------------------------
// Helpers
//---------------------------------------------------------------------

/// Records every lifecycle event emitted by a node.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<LifecycleEvent>>>);

impl EventLog {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl EventHandler for EventLog {
    fn handle(&self, event: &LifecycleEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

pub fn random_base_port() -> usize {
    rand::thread_rng().gen_range(21000..50000)
}

pub fn with_peer_id(addr: Multiaddr, peer_id: PeerId) -> Multiaddr {
    format!("{addr}/p2p/{peer_id}").parse().unwrap()
}

pub fn init_logging() {
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let filter = EnvFilter::builder()
        .parse("info,pricefeed_network=debug,libp2p_gossipsub=warn")
        .unwrap();

    pub fn enable_ansi() -> bool {
        use std::io::IsTerminal;
        std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
    }

    let subscriber = FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .with_ansi(enable_ansi())
        .with_thread_ids(false)
        .finish();

    if let Err(e) = subscriber.try_init() {
        debug!("Logging already initialized: {e}");
    }
}
