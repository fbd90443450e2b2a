//! Application-facing pub-sub contract, and its implementation over a [`Node`].

use std::future::Future;
use std::sync::Arc;

use crate::error::Error;
use crate::message::{Message, Messages};
use crate::node::Node;

/// Topic-based publish/subscribe.
pub trait Transport: Send + Sync {
    /// Join `topic`, decoding inbound payloads as `M`.
    fn subscribe<M: Message + 'static>(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Leave `topic`.
    fn unsubscribe(&self, topic: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Publish on a topic the transport is subscribed to.
    fn broadcast(
        &self,
        topic: &str,
        message: &dyn Message,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Stream of validated messages for a subscribed topic.
    fn messages(&self, topic: &str) -> Result<Messages, Error>;
}

/// [`Transport`] backed by a libp2p [`Node`].
#[derive(Clone)]
pub struct P2pTransport {
    node: Arc<Node>,
}

impl P2pTransport {
    pub fn new(node: Node) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub async fn start(&self) -> Result<(), Error> {
        self.node.start().await
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.node.stop().await
    }
}

impl From<Arc<Node>> for P2pTransport {
    fn from(node: Arc<Node>) -> Self {
        Self { node }
    }
}

impl Transport for P2pTransport {
    async fn subscribe<M: Message + 'static>(&self, topic: &str) -> Result<(), Error> {
        self.node.subscribe::<M>(topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.node.unsubscribe(topic).await
    }

    async fn broadcast(&self, topic: &str, message: &dyn Message) -> Result<(), Error> {
        self.node.publish(topic, message).await
    }

    fn messages(&self, topic: &str) -> Result<Messages, Error> {
        self.node.messages(topic)
    }
}
