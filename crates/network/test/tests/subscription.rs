use std::sync::{Arc, Mutex};
use std::time::Duration;

use pricefeed_network::{Error, PeerEvent, ReceivedMessage};
use pricefeed_network_test::{Expected, Network, TestNode, Text};
use tokio::time::{sleep, timeout};

const TOPIC: &str = "prices";

async fn next(messages: &pricefeed_network::Messages) -> ReceivedMessage {
    timeout(Duration::from_secs(10), messages.recv())
        .await
        .expect("no message received in time")
        .expect("delivery channel closed")
}

#[tokio::test]
pub async fn double_subscribe_is_rejected() {
    let network = Network::start([TestNode::correct(vec![])]).await;
    let node = network.node(0);

    node.subscribe::<Text>(TOPIC).await.unwrap();

    assert!(matches!(
        node.subscribe::<Text>(TOPIC).await,
        Err(Error::AlreadySubscribed(topic)) if topic == TOPIC
    ));

    // The first subscription is left untouched
    assert!(node.is_subscribed(TOPIC));

    let messages = node.messages(TOPIC).unwrap();
    node.publish(TOPIC, &Text::new("still here")).await.unwrap();

    let received = next(&messages).await;
    assert_eq!(received.message_as::<Text>(), Some(&Text::new("still here")));

    network.stop().await;
}

#[tokio::test]
pub async fn publish_requires_subscription() {
    let network = Network::start([TestNode::correct(vec![])]).await;
    let node = network.node(0);

    assert!(matches!(
        node.publish(TOPIC, &Text::new("nope")).await,
        Err(Error::NotSubscribed(_))
    ));
    assert!(matches!(
        node.unsubscribe(TOPIC).await,
        Err(Error::NotSubscribed(_))
    ));

    network.stop().await;
}

#[tokio::test]
pub async fn unsubscribe_closes_the_stream() {
    let network = Network::start([TestNode::correct(vec![])]).await;
    let node = network.node(0);

    node.subscribe::<Text>(TOPIC).await.unwrap();
    let messages = node.messages(TOPIC).unwrap();

    node.unsubscribe(TOPIC).await.unwrap();
    assert!(!node.is_subscribed(TOPIC));

    let end = timeout(Duration::from_secs(5), messages.recv()).await.unwrap();
    assert!(end.is_none());

    // The topic can be joined again
    node.subscribe::<Text>(TOPIC).await.unwrap();

    network.stop().await;
}

#[tokio::test]
pub async fn empty_payload_is_refused() {
    let network = Network::start([TestNode::correct(vec![])]).await;
    let node = network.node(0);

    node.subscribe::<Text>(TOPIC).await.unwrap();

    assert!(matches!(
        node.publish(TOPIC, &Text::new("")).await,
        Err(Error::NilPayload)
    ));

    // Nothing was echoed back
    let messages = node.messages(TOPIC).unwrap();
    assert!(timeout(Duration::from_millis(500), messages.recv())
        .await
        .is_err());

    network.stop().await;
}

type PeerEventLog = Arc<Mutex<Vec<(String, PeerEvent)>>>;

async fn wait_for_peer_event(log: &PeerEventLog, expected: (&str, PeerEvent)) {
    let found = timeout(Duration::from_secs(10), async {
        loop {
            let seen = log
                .lock()
                .unwrap()
                .iter()
                .any(|(topic, event)| topic == expected.0 && *event == expected.1);

            if seen {
                return;
            }

            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    assert!(found.is_ok(), "{expected:?} not reported, got {:?}", log.lock().unwrap());
}

#[tokio::test]
pub async fn peers_joining_and_leaving_the_topic_are_reported() {
    let log = PeerEventLog::default();
    let sink = log.clone();

    let network = Network::start([
        TestNode::correct(vec![]).with(move |builder| {
            builder.peer_event_handler(Arc::new(move |topic: &str, event: &PeerEvent| {
                sink.lock().unwrap().push((topic.to_string(), *event));
            }))
        }),
        TestNode::correct(vec![0]),
    ])
    .await;

    network.node(0).subscribe::<Text>(TOPIC).await.unwrap();
    network
        .wait_for_peers(0, Expected::Exactly(vec![1]), Duration::from_secs(10))
        .await;

    let peer = network.peer_id(1);

    network.node(1).subscribe::<Text>(TOPIC).await.unwrap();
    wait_for_peer_event(&log, (TOPIC, PeerEvent::Joined(peer))).await;

    network.node(1).unsubscribe(TOPIC).await.unwrap();
    wait_for_peer_event(&log, (TOPIC, PeerEvent::Left(peer))).await;

    let events: Vec<_> = log.lock().unwrap().iter().map(|(_, event)| *event).collect();
    assert_eq!(events, vec![PeerEvent::Joined(peer), PeerEvent::Left(peer)]);

    network.stop().await;
}
