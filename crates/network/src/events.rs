//! Observer sets notified by the [`Node`](crate::Node).
//!
//! Each set is an append-only list of observers, notified in registration order.
//! Observers can be added at any time, but lifecycle events are not replayed to
//! observers registered after they fired.

use std::fmt;
use std::sync::{Arc, RwLock};

use libp2p::{Multiaddr, PeerId};

use crate::error::BoxError;
use crate::message::{Message, RawMessage};
use crate::validation::{ValidationResult, Validator, ValidatorChain};

/// Lifecycle of a node and its topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Configured,
    Starting,
    HostStarted,
    PubSubStarted,
    Started,
    TopicSubscribed { topic: String },
    TopicUnsubscribed { topic: String },
    Stopping,
    Stopped,
}

pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &LifecycleEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&LifecycleEvent) + Send + Sync + 'static,
{
    fn handle(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Notified about listen addresses and peer connections.
#[allow(unused_variables)]
pub trait ConnectionNotifee: Send + Sync + 'static {
    fn listen(&self, addr: &Multiaddr) {}

    fn listen_close(&self, addr: &Multiaddr) {}

    /// First connection to `peer` established
    fn connected(&self, peer: &PeerId, addr: &Multiaddr) {}

    /// Last connection to `peer` closed
    fn disconnected(&self, peer: &PeerId) {}
}

/// A peer joining or leaving a topic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Joined(PeerId),
    Left(PeerId),
}

impl PeerEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::Joined(peer) | Self::Left(peer) => peer,
        }
    }
}

pub trait PeerEventHandler: Send + Sync + 'static {
    fn handle(&self, topic: &str, event: &PeerEvent);
}

impl<F> PeerEventHandler for F
where
    F: Fn(&str, &PeerEvent) + Send + Sync + 'static,
{
    fn handle(&self, topic: &str, event: &PeerEvent) {
        self(topic, event)
    }
}

/// Notified about every message published or received on a subscribed topic.
#[allow(unused_variables)]
pub trait MessageHandler: Send + Sync + 'static {
    fn published(&self, topic: &str, message: &dyn Message) {}

    /// A message was decoded and validated, whatever the outcome
    fn received(
        &self,
        topic: &str,
        raw: &RawMessage,
        message: &dyn Message,
        result: ValidationResult,
    ) {
    }

    /// A message could not be decoded
    fn broken(&self, topic: &str, raw: &RawMessage, error: &BoxError) {}

    /// A message was dropped by the rate limiter before being decoded
    fn throttled(&self, topic: &str, raw: &RawMessage) {}
}

/// Append-only list of observers.
pub struct Observers<T: ?Sized> {
    inner: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for Observers<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Observers<T> {
    pub fn add(&self, observer: Arc<T>) {
        self.inner.write().expect("poisoned lock").push(observer);
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current observers, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner.read().expect("poisoned lock").clone()
    }

    /// Call `f` on every observer, without holding the lock.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for observer in self.snapshot() {
            f(&observer);
        }
    }
}

impl<T: ?Sized> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.len())
            .finish()
    }
}

/// All observer sets owned by a node, shared with its subscriptions.
#[derive(Debug, Default)]
pub struct Registries {
    pub events: Observers<dyn EventHandler>,
    pub connections: Observers<dyn ConnectionNotifee>,
    pub peer_events: Observers<dyn PeerEventHandler>,
    pub messages: Observers<dyn MessageHandler>,
    pub validators: Observers<dyn Validator>,
}

impl Registries {
    pub fn emit(&self, event: LifecycleEvent) {
        self.events.for_each(|handler| handler.handle(&event));
    }

    pub fn validator_chain(&self) -> ValidatorChain {
        ValidatorChain::new(self.validators.snapshot())
    }
}
