//! Built-in observers: tracing loggers for every observer set, and a prometheus monitor.

use std::sync::Arc;

use libp2p::{Multiaddr, PeerId};
use pricefeed_metrics::prometheus::encoding::EncodeLabelSet;
use pricefeed_metrics::{Counter, Family, Gauge, SharedRegistry};
use tracing::{debug, info, trace, warn};

// Make prometheus_client available for the derive macro
use pricefeed_metrics::prometheus as prometheus_client;

use crate::error::BoxError;
use crate::events::{
    ConnectionNotifee, EventHandler, LifecycleEvent, MessageHandler, PeerEvent, PeerEventHandler,
    Registries,
};
use crate::message::{Message, RawMessage};
use crate::validation::ValidationResult;

const METRICS_PREFIX: &str = "pricefeed_network";

#[derive(Copy, Clone, Debug, Default)]
pub struct LifecycleLogger;

impl EventHandler for LifecycleLogger {
    fn handle(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Configured => debug!("Node configured"),
            LifecycleEvent::Starting => info!("Starting node"),
            LifecycleEvent::HostStarted => debug!("Host started"),
            LifecycleEvent::PubSubStarted => debug!("Pub-sub started"),
            LifecycleEvent::Started => info!("Node started"),
            LifecycleEvent::TopicSubscribed { topic } => info!(%topic, "Subscribed to topic"),
            LifecycleEvent::TopicUnsubscribed { topic } => {
                info!(%topic, "Unsubscribed from topic")
            }
            LifecycleEvent::Stopping => info!("Stopping node"),
            LifecycleEvent::Stopped => info!("Node stopped"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ConnectionLogger;

impl ConnectionNotifee for ConnectionLogger {
    fn listen(&self, addr: &Multiaddr) {
        info!(%addr, "Listening");
    }

    fn listen_close(&self, addr: &Multiaddr) {
        debug!(%addr, "Stopped listening");
    }

    fn connected(&self, peer: &PeerId, addr: &Multiaddr) {
        debug!(%peer, %addr, "Peer connected");
    }

    fn disconnected(&self, peer: &PeerId) {
        debug!(%peer, "Peer disconnected");
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct PeerEventLogger;

impl PeerEventHandler for PeerEventLogger {
    fn handle(&self, topic: &str, event: &PeerEvent) {
        match event {
            PeerEvent::Joined(peer) => debug!(%topic, %peer, "Peer joined topic"),
            PeerEvent::Left(peer) => debug!(%topic, %peer, "Peer left topic"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct MessageLogger;

impl MessageHandler for MessageLogger {
    fn published(&self, topic: &str, _message: &dyn Message) {
        trace!(%topic, "Publishing message");
    }

    fn received(
        &self,
        topic: &str,
        raw: &RawMessage,
        _message: &dyn Message,
        result: ValidationResult,
    ) {
        match result {
            ValidationResult::Accept => {
                trace!(%topic, source = %raw.source, size = raw.data.len(), "Accepted message")
            }
            ValidationResult::Ignore => {
                debug!(%topic, source = %raw.source, size = raw.data.len(), "Ignored message")
            }
            ValidationResult::Reject => {
                warn!(%topic, source = %raw.source, size = raw.data.len(), "Rejected message")
            }
        }
    }

    fn broken(&self, topic: &str, raw: &RawMessage, error: &BoxError) {
        warn!(
            %topic,
            source = %raw.source,
            size = raw.data.len(),
            "Failed to decode message: {error}"
        );
    }

    fn throttled(&self, topic: &str, raw: &RawMessage) {
        debug!(
            %topic,
            peer = %raw.propagation_source,
            size = raw.data.len(),
            "Rate limit exceeded, ignoring message"
        );
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TopicLabels {
    topic: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct VerdictLabels {
    topic: String,
    verdict: String,
}

/// Prometheus counters for message traffic and connected peers.
#[derive(Clone, Debug)]
pub struct Monitor {
    published: Family<TopicLabels, Counter>,
    received: Family<VerdictLabels, Counter>,
    broken: Family<TopicLabels, Counter>,
    throttled: Family<TopicLabels, Counter>,
    connected_peers: Gauge,
}

impl Monitor {
    pub fn register(registry: &SharedRegistry) -> Self {
        let monitor = Self {
            published: Family::default(),
            received: Family::default(),
            broken: Family::default(),
            throttled: Family::default(),
            connected_peers: Gauge::default(),
        };

        registry.with_prefix(METRICS_PREFIX, |registry| {
            registry.register(
                "messages_published",
                "Messages published by this node",
                monitor.published.clone(),
            );
            registry.register(
                "messages_received",
                "Messages received, by validation verdict",
                monitor.received.clone(),
            );
            registry.register(
                "messages_broken",
                "Messages that could not be decoded",
                monitor.broken.clone(),
            );
            registry.register(
                "messages_throttled",
                "Messages dropped by the rate limiter",
                monitor.throttled.clone(),
            );
            registry.register(
                "connected_peers",
                "Number of connected peers",
                monitor.connected_peers.clone(),
            );
        });

        monitor
    }

    fn topic(topic: &str) -> TopicLabels {
        TopicLabels {
            topic: topic.to_string(),
        }
    }
}

impl ConnectionNotifee for Monitor {
    fn connected(&self, _peer: &PeerId, _addr: &Multiaddr) {
        self.connected_peers.inc();
    }

    fn disconnected(&self, _peer: &PeerId) {
        self.connected_peers.dec();
    }
}

impl MessageHandler for Monitor {
    fn published(&self, topic: &str, _message: &dyn Message) {
        self.published.get_or_create(&Self::topic(topic)).inc();
    }

    fn received(
        &self,
        topic: &str,
        _raw: &RawMessage,
        _message: &dyn Message,
        result: ValidationResult,
    ) {
        let labels = VerdictLabels {
            topic: topic.to_string(),
            verdict: result.as_str().to_string(),
        };

        self.received.get_or_create(&labels).inc();
    }

    fn broken(&self, topic: &str, _raw: &RawMessage, _error: &BoxError) {
        self.broken.get_or_create(&Self::topic(topic)).inc();
    }

    fn throttled(&self, topic: &str, _raw: &RawMessage) {
        self.throttled.get_or_create(&Self::topic(topic)).inc();
    }
}

/// Register the tracing loggers, and a monitor when a registry is given.
pub fn register_defaults(registries: &Registries, registry: Option<&SharedRegistry>) {
    registries.events.add(Arc::new(LifecycleLogger));
    registries.connections.add(Arc::new(ConnectionLogger));
    registries.peer_events.add(Arc::new(PeerEventLogger));
    registries.messages.add(Arc::new(MessageLogger));

    if let Some(registry) = registry {
        let monitor = Arc::new(Monitor::register(registry));
        registries.connections.add(monitor.clone());
        registries.messages.add(monitor);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pricefeed_metrics::Registry;

    use super::*;
    use crate::message::tests::Text;

    #[test]
    fn monitor_counts_by_verdict() {
        let registry = SharedRegistry::new(Registry::default(), Some("relay-0".to_string()));
        let monitor = Monitor::register(&registry);

        let peer = PeerId::random();
        let raw = RawMessage {
            topic: "prices".to_string(),
            data: Bytes::from_static(b"x"),
            source: peer,
            propagation_source: peer,
            message_id: None,
        };

        let text = Text("x".into());
        monitor.received("prices", &raw, &text, ValidationResult::Reject);
        monitor.received("prices", &raw, &text, ValidationResult::Reject);
        monitor.connected(&peer, &"/ip4/127.0.0.1/tcp/1".parse().unwrap());

        let mut out = String::new();
        registry.encode(&mut out).unwrap();

        let received = out
            .lines()
            .find(|line| line.starts_with("pricefeed_network_messages_received_total{"))
            .unwrap();

        assert!(received.contains(r#"moniker="relay-0""#));
        assert!(received.contains(r#"verdict="reject""#));
        assert!(received.ends_with(" 2"));
        assert!(out.contains(r#"pricefeed_network_connected_peers{moniker="relay-0"} 1"#));
    }
}
