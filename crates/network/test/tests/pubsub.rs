use std::sync::Arc;
use std::time::Duration;

use pricefeed_network::{Message, Messages, PeerId, ReceivedMessage, ValidationResult};
use pricefeed_network_test::{Expected, Network, TestNode, Text};
use tokio::time::timeout;

const TOPIC: &str = "prices";

async fn next(messages: &Messages) -> ReceivedMessage {
    timeout(Duration::from_secs(10), messages.recv())
        .await
        .expect("no message received in time")
        .expect("delivery channel closed")
}

async fn joined(network: &Network<2>) {
    for (i, j) in [(0, 1), (1, 0)] {
        network.node(i).subscribe::<Text>(TOPIC).await.unwrap();
        network
            .wait_for_peers(i, Expected::Exactly(vec![j]), Duration::from_secs(10))
            .await;
    }

    for (i, j) in [(0, 1), (1, 0)] {
        network
            .wait_for_topic_peers(i, TOPIC, Expected::Exactly(vec![j]), Duration::from_secs(10))
            .await;
    }
}

#[tokio::test]
pub async fn published_message_reaches_peer_and_echoes_locally() {
    let network = Network::start([TestNode::correct(vec![]), TestNode::correct(vec![0])]).await;
    joined(&network).await;

    let local = network.node(0).messages(TOPIC).unwrap();
    let remote = network.node(1).messages(TOPIC).unwrap();

    network
        .node(0)
        .publish(TOPIC, &Text::new("eth/usd 3000"))
        .await
        .unwrap();

    let echo = next(&local).await;
    assert_eq!(echo.message_as::<Text>(), Some(&Text::new("eth/usd 3000")));
    assert_eq!(echo.source(), Some(network.peer_id(0)));
    assert!(echo.raw.as_ref().unwrap().is_local());

    let received = next(&remote).await;
    assert_eq!(
        received.message_as::<Text>(),
        Some(&Text::new("eth/usd 3000"))
    );
    assert_eq!(received.source(), Some(network.peer_id(0)));
    assert!(!received.raw.as_ref().unwrap().is_local());

    network.stop().await;
}

#[tokio::test]
pub async fn rejected_message_is_not_delivered() {
    let reject_bad = |_: &str, _: &PeerId, message: &dyn Message| {
        match message.downcast_ref::<Text>() {
            Some(Text(text)) if text == "bad" => ValidationResult::Reject,
            _ => ValidationResult::Accept,
        }
    };

    let network = Network::start([
        TestNode::correct(vec![]),
        TestNode::correct(vec![0]).with(move |builder| builder.validator(Arc::new(reject_bad))),
    ])
    .await;

    joined(&network).await;

    let remote = network.node(1).messages(TOPIC).unwrap();

    network.node(0).publish(TOPIC, &Text::new("bad")).await.unwrap();
    network.node(0).publish(TOPIC, &Text::new("good")).await.unwrap();

    let received = next(&remote).await;
    assert_eq!(received.message_as::<Text>(), Some(&Text::new("good")));

    network.stop().await;
}

#[tokio::test]
pub async fn undecodable_message_is_not_delivered() {
    let network = Network::start([TestNode::correct(vec![]), TestNode::correct(vec![0])]).await;
    joined(&network).await;

    let remote = network.node(1).messages(TOPIC).unwrap();

    #[derive(Debug)]
    struct Garbage;

    impl Message for Garbage {
        fn marshal_binary(&self) -> Result<Vec<u8>, pricefeed_network::BoxError> {
            Ok(vec![0xff, 0xfe, 0xfd])
        }

        fn unmarshal_binary(_: &[u8]) -> Result<Self, pricefeed_network::BoxError> {
            Ok(Self)
        }
    }

    // The local echo of garbage is rejected too, so only the text arrives
    network.node(0).publish(TOPIC, &Garbage).await.unwrap();
    network.node(0).publish(TOPIC, &Text::new("ok")).await.unwrap();

    let received = next(&remote).await;
    assert_eq!(received.message_as::<Text>(), Some(&Text::new("ok")));

    network.stop().await;
}

#[tokio::test]
pub async fn peer_scores_are_tracked() {
    let network = Network::start([TestNode::correct(vec![]), TestNode::correct(vec![0])]).await;
    joined(&network).await;

    let score = network
        .node(0)
        .peer_score(network.peer_id(1))
        .await
        .unwrap();

    assert!(score.is_some(), "scoring is enabled by default");

    network.stop().await;
}
