use std::sync::Arc;
use std::time::Duration;

use pricefeed_network::{Error, LifecycleEvent, Messages};
use pricefeed_network_test::{EventLog, Network, TestNode, Text};
use tokio::time::timeout;

/// Start a node, join `n` topics, stop it, and check that every delivery channel ends.
async fn run_no_leak(n: usize) {
    let log = EventLog::default();
    let handler = log.clone();

    let network = Network::start([TestNode::correct(vec![])
        .with(move |builder| builder.event_handler(Arc::new(handler)))])
    .await;

    let node = network.node(0);
    let mut streams: Vec<Messages> = Vec::with_capacity(n);

    for i in 0..n {
        let topic = format!("topic-{i}");
        node.subscribe::<Text>(topic.as_str()).await.unwrap();
        streams.push(node.messages(&topic).unwrap());
    }

    node.stop().await.unwrap();

    for stream in streams {
        let end = timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("delivery channel still open after stop");

        assert!(end.is_none(), "unexpected message on {}", stream.topic());
    }

    let mut expected = vec![
        LifecycleEvent::Configured,
        LifecycleEvent::Starting,
        LifecycleEvent::HostStarted,
        LifecycleEvent::PubSubStarted,
        LifecycleEvent::Started,
    ];

    expected.extend((0..n).map(|i| LifecycleEvent::TopicSubscribed {
        topic: format!("topic-{i}"),
    }));

    expected.extend([LifecycleEvent::Stopping, LifecycleEvent::Stopped]);

    assert_eq!(log.events(), expected);
    assert!(!node.is_running());
}

#[tokio::test]
pub async fn no_leak_without_subscriptions() {
    run_no_leak(0).await
}

#[tokio::test]
pub async fn no_leak_with_one_subscription() {
    run_no_leak(1).await
}

#[tokio::test]
pub async fn no_leak_with_two_subscriptions() {
    run_no_leak(2).await
}

#[tokio::test]
pub async fn stop_twice_fails() {
    let network = Network::start([TestNode::correct(vec![])]).await;
    let node = network.node(0);

    node.stop().await.unwrap();

    assert!(matches!(node.stop().await, Err(Error::Closed)));
    assert!(matches!(node.start().await, Err(Error::Closed)));
    assert!(matches!(
        node.subscribe::<Text>("prices").await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
pub async fn start_twice_fails() {
    let network = Network::start([TestNode::correct(vec![])]).await;

    assert!(matches!(
        network.node(0).start().await,
        Err(Error::AlreadyStarted)
    ));

    network.stop().await;
}

#[tokio::test]
pub async fn listen_addrs_are_reported() {
    let network = Network::start([TestNode::correct(vec![])]).await;

    let node = network.node(0);

    let addrs = timeout(Duration::from_secs(5), async {
        loop {
            let addrs = node.listen_addrs().await.unwrap();
            if !addrs.is_empty() {
                return addrs;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node is not listening");

    assert_eq!(&addrs, &node.config().listen_addrs);

    network.stop().await;
}
