use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use libp2p::gossipsub::MessageId;
use libp2p::PeerId;
use tokio::sync::{mpsc, Mutex};

use crate::error::{BoxError, Error};

/// Upcast helper so that `dyn Message` can be downcast to its concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A payload that can be carried over a topic.
pub trait Message: AsAny + fmt::Debug + Send + Sync {
    fn marshal_binary(&self) -> Result<Vec<u8>, BoxError>;

    fn unmarshal_binary(bytes: &[u8]) -> Result<Self, BoxError>
    where
        Self: Sized;
}

impl dyn Message {
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Turns raw bytes into the message type declared for a topic.
pub(crate) type Decoder = fn(&[u8]) -> Result<Arc<dyn Message>, BoxError>;

pub(crate) fn decoder<M: Message + 'static>() -> Decoder {
    |bytes| M::unmarshal_binary(bytes).map(|m| Arc::new(m) as Arc<dyn Message>)
}

/// A message as handed over by the router, before validation.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub topic: String,
    pub data: Bytes,
    /// Author of the message, as authenticated by the router
    pub source: PeerId,
    /// Peer we received the message from
    pub propagation_source: PeerId,
    /// Router identifier, `None` for messages published by this node
    pub message_id: Option<MessageId>,
}

impl RawMessage {
    pub fn is_local(&self) -> bool {
        self.message_id.is_none()
    }
}

/// An item delivered on a subscription channel.
///
/// Accepted messages carry both the decoded message and the envelope it came in.
/// Delivery problems, such as dropped messages, carry only an error.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub message: Option<Arc<dyn Message>>,
    pub raw: Option<RawMessage>,
    pub error: Option<Arc<Error>>,
}

impl ReceivedMessage {
    pub(crate) fn accepted(message: Arc<dyn Message>, raw: RawMessage) -> Self {
        Self {
            message: Some(message),
            raw: Some(raw),
            error: None,
        }
    }

    pub(crate) fn failed(error: Error) -> Self {
        Self {
            message: None,
            raw: None,
            error: Some(Arc::new(error)),
        }
    }

    /// Downcast the decoded message, if any, to its concrete type.
    pub fn message_as<T: Message>(&self) -> Option<&T> {
        self.message.as_deref().and_then(|m| m.downcast_ref::<T>())
    }

    pub fn source(&self) -> Option<PeerId> {
        self.raw.as_ref().map(|raw| raw.source)
    }
}

/// Receiving side of a subscription.
///
/// Clones share the same underlying channel, so each message is observed by one of them.
/// The channel ends once the subscription is closed.
#[derive(Clone, Debug)]
pub struct Messages {
    topic: String,
    rx: Arc<Mutex<mpsc::Receiver<ReceivedMessage>>>,
}

impl Messages {
    pub(crate) fn new(topic: String, rx: mpsc::Receiver<ReceivedMessage>) -> Self {
        Self {
            topic,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&self) -> Option<ReceivedMessage> {
        self.rx.lock().await.recv().await
    }
}
