use libp2p::Multiaddr;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by [`Node`](crate::Node) and [`Subscription`](crate::Subscription) operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("address {0} must end with a /p2p/<peer id> component")]
    MissingPeerId(Multiaddr),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("node is already started")]
    AlreadyStarted,

    #[error("node is not running")]
    NotRunning,

    #[error("node is closed")]
    Closed,

    #[error("pub-sub is disabled")]
    PubSubDisabled,

    #[error("already subscribed to topic {0}")]
    AlreadySubscribed(String),

    #[error("not subscribed to topic {0}")]
    NotSubscribed(String),

    #[error("cannot publish a nil payload")]
    NilPayload,

    #[error("failed to encode message: {0}")]
    Encode(#[source] BoxError),

    #[error("subscriber lagged behind, {0} messages were dropped")]
    Lagged(u64),

    #[error("failed to publish: {0}")]
    Publish(String),

    #[error("failed to subscribe: {0}")]
    Subscribe(String),

    #[error("failed to start: {0}")]
    Start(#[source] BoxError),

    #[error("network task is gone")]
    TaskGone,
}
