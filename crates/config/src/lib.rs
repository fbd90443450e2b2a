use core::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytesize::ByteSize;
use ipnet::IpNet;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};

/// Node configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// A custom human-readable name for this node
    pub moniker: String,

    /// P2P configuration options
    pub p2p: P2pConfig,

    /// Addresses of the feeders allowed to publish price attestations
    #[serde(default)]
    pub feeders: Vec<String>,

    /// Keys used by this node
    #[serde(default)]
    pub keys: KeysConfig,

    /// Metrics configuration options
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log configuration options
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Runtime configuration options
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolNames {
    /// Protocol version advertised over Identify, peers with a different one are ignored
    pub identify: String,

    /// Kademlia protocol name used for discovery
    pub discovery_kad: String,
}

impl Default for ProtocolNames {
    fn default() -> Self {
        Self {
            identify: "/pricefeed/v1".to_string(),
            discovery_kad: "/pricefeed/kad/v1".to_string(),
        }
    }
}

/// P2P configuration options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Addresses to listen for incoming connections
    pub listen_addrs: Vec<Multiaddr>,

    /// Nodes used to seed peer discovery, each address must end with `/p2p/<peer id>`
    #[serde(default)]
    pub bootstrap_addrs: Vec<Multiaddr>,

    /// Nodes to keep a direct connection to, each address must end with `/p2p/<peer id>`
    #[serde(default)]
    pub direct_peers: Vec<Multiaddr>,

    /// Networks that must never be dialled
    #[serde(default)]
    pub blocked_addrs: Vec<IpNet>,

    /// Peers that must never be dialled
    #[serde(default)]
    pub blocked_peers: Vec<String>,

    /// Peer discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Transport used to dial and listen
    #[serde(default)]
    pub transport: TransportProtocol,

    /// GossipSub mesh configuration
    #[serde(default)]
    pub gossipsub: GossipSubConfig,

    /// Inbound message rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Peer scoring
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// The maximum size of messages to send over pub-sub
    pub pubsub_max_size: ByteSize,

    /// How often disconnected direct peers are dialled again
    #[serde(with = "humantime_serde")]
    pub direct_connect_interval: Duration,

    /// How long an idle connection is kept open
    #[serde(with = "humantime_serde")]
    pub idle_connection_timeout: Duration,

    /// Protocol name configuration
    #[serde(default)]
    pub protocol_names: ProtocolNames,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            listen_addrs: vec![],
            bootstrap_addrs: vec![],
            direct_peers: vec![],
            blocked_addrs: vec![],
            blocked_peers: vec![],
            discovery: Default::default(),
            transport: Default::default(),
            gossipsub: Default::default(),
            rate_limit: Default::default(),
            scoring: Default::default(),
            pubsub_max_size: ByteSize::mib(1),
            direct_connect_interval: Duration::from_secs(30),
            idle_connection_timeout: Duration::from_secs(60),
            protocol_names: Default::default(),
        }
    }
}

/// Peer Discovery configuration options
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Enable Kademlia peer discovery, seeded with the bootstrap addresses
    #[serde(default)]
    pub enabled: bool,

    /// Interval between two random walks in the DHT
    #[serde(default = "default_bootstrap_interval")]
    #[serde(with = "humantime_serde")]
    pub bootstrap_interval: Duration,
}

fn default_bootstrap_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            enabled: false,
            bootstrap_interval: default_bootstrap_interval(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Quic,
}

impl TransportProtocol {
    pub fn multiaddr(&self, host: &str, port: usize) -> Multiaddr {
        match self {
            Self::Tcp => format!("/ip4/{host}/tcp/{port}").parse().unwrap(),
            Self::Quic => format!("/ip4/{host}/udp/{port}/quic-v1").parse().unwrap(),
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "quic" => Ok(Self::Quic),
            e => Err(format!(
                "unknown transport protocol: {e}, available: tcp, quic"
            )),
        }
    }
}

/// GossipSub configuration
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "gossipsub::RawConfig", default)]
pub struct GossipSubConfig {
    /// Target number of peers for the mesh network (D in the GossipSub spec)
    mesh_n: usize,

    /// Maximum number of peers in mesh network before removing some (D_high in the GossipSub spec)
    mesh_n_high: usize,

    /// Minimum number of peers in mesh network before adding more (D_low in the spec)
    mesh_n_low: usize,

    /// Minimum number of outbound peers in the mesh network before adding more (D_out in the spec).
    /// This value must be smaller or equal than `mesh_n / 2` and smaller than `mesh_n_low`.
    /// When this value is set to 0 or does not meet the above constraints,
    /// it will be calculated as `max(1, min(mesh_n / 2, mesh_n_low - 1))`
    mesh_outbound_min: usize,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self::new(6, 12, 4, 2)
    }
}

impl GossipSubConfig {
    /// Create a new, valid GossipSub configuration.
    pub fn new(
        mesh_n: usize,
        mesh_n_high: usize,
        mesh_n_low: usize,
        mesh_outbound_min: usize,
    ) -> Self {
        let mut result = Self {
            mesh_n,
            mesh_n_high,
            mesh_n_low,
            mesh_outbound_min,
        };

        result.adjust();
        result
    }

    /// Adjust the configuration values.
    pub fn adjust(&mut self) {
        use std::cmp::{max, min};

        if self.mesh_n == 0 {
            self.mesh_n = 6;
        }

        if self.mesh_n_high == 0 || self.mesh_n_high < self.mesh_n {
            self.mesh_n_high = self.mesh_n * 2;
        }

        if self.mesh_n_low == 0 || self.mesh_n_low > self.mesh_n {
            self.mesh_n_low = self.mesh_n * 2 / 3;
        }

        if self.mesh_outbound_min == 0
            || self.mesh_outbound_min > self.mesh_n / 2
            || self.mesh_outbound_min >= self.mesh_n_low
        {
            self.mesh_outbound_min = max(1, min(self.mesh_n / 2, self.mesh_n_low - 1));
        }
    }

    pub fn mesh_n(&self) -> usize {
        self.mesh_n
    }

    pub fn mesh_n_high(&self) -> usize {
        self.mesh_n_high
    }

    pub fn mesh_n_low(&self) -> usize {
        self.mesh_n_low
    }

    pub fn mesh_outbound_min(&self) -> usize {
        self.mesh_outbound_min
    }
}

mod gossipsub {
    #[derive(serde::Deserialize)]
    pub struct RawConfig {
        #[serde(default)]
        mesh_n: usize,
        #[serde(default)]
        mesh_n_high: usize,
        #[serde(default)]
        mesh_n_low: usize,
        #[serde(default)]
        mesh_outbound_min: usize,
    }

    impl From<RawConfig> for super::GossipSubConfig {
        fn from(raw: RawConfig) -> Self {
            super::GossipSubConfig::new(
                raw.mesh_n,
                raw.mesh_n_high,
                raw.mesh_n_low,
                raw.mesh_outbound_min,
            )
        }
    }
}

/// Token bucket budget applied to inbound pub-sub messages.
///
/// Every peer gets its own bucket, and all peers share the global one.
/// Both are measured in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Bytes per second refilled into each peer bucket
    pub peer_rate: ByteSize,

    /// Capacity of each peer bucket
    pub peer_burst: ByteSize,

    /// Bytes per second refilled into the global bucket
    pub global_rate: ByteSize,

    /// Capacity of the global bucket
    pub global_burst: ByteSize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            peer_rate: ByteSize::kib(8),
            peer_burst: ByteSize::kib(128),
            global_rate: ByteSize::kib(512),
            global_burst: ByteSize::mib(8),
        }
    }
}

/// Inputs for one component of the peer score.
///
/// `score` is the number of points a peer collects (or loses, when negative)
/// once it behaves as expected for `duration` at `min_rate` messages per second.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponentConfig {
    /// Points reached at the target
    pub score: f64,

    /// Time needed to reach the target
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Expected minimum message rate, in messages per second
    #[serde(default)]
    pub min_rate: f64,

    /// Expected maximum message rate, in messages per second
    #[serde(default)]
    pub max_rate: f64,
}

impl ScoreComponentConfig {
    pub const fn new(score: f64, duration: Duration, min_rate: f64, max_rate: f64) -> Self {
        Self {
            score,
            duration,
            min_rate,
            max_rate,
        }
    }
}

/// Penalty applied for messages that fail validation.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvalidMessagesConfig {
    /// Points lost once `max_per_hour` invalid messages have been seen, must be negative
    pub penalty: f64,

    /// Number of invalid messages tolerated per hour
    pub max_per_hour: f64,
}

impl Default for InvalidMessagesConfig {
    fn default() -> Self {
        Self {
            penalty: -1000.0,
            max_per_hour: 10.0,
        }
    }
}

/// Score thresholds, see the GossipSub v1.1 specification.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreThresholdsConfig {
    pub gossip: f64,
    pub publish: f64,
    pub graylist: f64,
    pub accept_px: f64,
    pub opportunistic_graft: f64,
}

impl Default for ScoreThresholdsConfig {
    fn default() -> Self {
        Self {
            gossip: -500.0,
            publish: -1000.0,
            graylist: -2000.0,
            accept_px: 100.0,
            opportunistic_graft: 5.0,
        }
    }
}

/// Peer scoring configuration
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Enable peer scoring
    pub enabled: bool,

    /// Weight of every topic score in the peer score
    pub topic_weight: f64,

    /// How often counters are decayed
    #[serde(with = "humantime_serde")]
    pub decay_interval: Duration,

    /// Value below which a decayed counter is considered zero
    pub decay_to_zero: f64,

    /// Time spent in the mesh
    pub time_in_mesh: ScoreComponentConfig,

    /// Messages delivered first by the peer
    pub first_message_deliveries: ScoreComponentConfig,

    /// Messages delivered by a mesh peer, penalized when below the minimum rate
    pub mesh_message_deliveries: ScoreComponentConfig,

    /// Delivery deficit carried over after a peer is pruned from the mesh
    pub mesh_failure_penalty: ScoreComponentConfig,

    /// Messages that failed validation
    #[serde(default)]
    pub invalid_messages: InvalidMessagesConfig,

    /// Score thresholds
    #[serde(default)]
    pub thresholds: ScoreThresholdsConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        const MINUTE: Duration = Duration::from_secs(60);
        const HOUR: Duration = Duration::from_secs(3600);

        Self {
            enabled: true,
            topic_weight: 1.0,
            decay_interval: Duration::from_secs(1),
            decay_to_zero: 0.01,
            time_in_mesh: ScoreComponentConfig::new(10.0, HOUR, 0.0, 0.0),
            first_message_deliveries: ScoreComponentConfig::new(50.0, HOUR, 1.0 / 60.0, 1.0),
            mesh_message_deliveries: ScoreComponentConfig::new(
                -50.0,
                MINUTE * 10,
                1.0 / 60.0,
                1.0,
            ),
            mesh_failure_penalty: ScoreComponentConfig::new(-50.0, HOUR, 1.0 / 60.0, 1.0),
            invalid_messages: InvalidMessagesConfig::default(),
            thresholds: ScoreThresholdsConfig::default(),
        }
    }
}

/// Keys used by the node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeysConfig {
    /// File holding the secp256k1 key used to sign prices and to identify on the network.
    /// A relay without a key file uses a fresh random network identity.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the metrics server
    pub enabled: bool,

    /// Address at which to serve the metrics at
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            listen_addr: SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 9000),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flavor", rename_all = "snake_case")]
pub enum RuntimeConfig {
    /// Single-threaded runtime
    #[default]
    SingleThreaded,

    /// Multi-threaded runtime
    MultiThreaded {
        /// Number of worker threads
        worker_threads: usize,
    },
}

impl RuntimeConfig {
    pub fn single_threaded() -> Self {
        Self::SingleThreaded
    }

    pub fn multi_threaded(worker_threads: usize) -> Self {
        Self::MultiThreaded { worker_threads }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            e => Err(format!("Invalid log level: {e}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            e => Err(format!("Invalid log format: {e}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}
