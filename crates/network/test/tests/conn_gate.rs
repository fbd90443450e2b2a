use std::time::Duration;

use pricefeed_network_test::{Expected, Network, TestNode};
use tokio::time::sleep;

#[tokio::test]
pub async fn blocked_peer_is_never_dialled() {
    let network =
        Network::start([TestNode::correct(vec![1]).blocking(vec![1]), TestNode::correct(vec![])])
            .await;

    sleep(Duration::from_secs(3)).await;

    Expected::Exactly(vec![]).check(&network.peers_of(0).await);
    Expected::Exactly(vec![]).check(&network.peers_of(1).await);

    network.stop().await;
}

#[tokio::test]
pub async fn blocking_at_runtime_disconnects() {
    let network = Network::start([TestNode::correct(vec![1]), TestNode::correct(vec![])]).await;

    network
        .wait_for_peers(0, Expected::Exactly(vec![1]), Duration::from_secs(10))
        .await;

    network.node(0).block_peer(network.peer_id(1));
    assert!(network.node(0).blocklist().is_peer_blocked(&network.peer_id(1)));

    // Redials happen every second, and must all be denied
    network
        .wait_for_peers(0, Expected::Exactly(vec![]), Duration::from_secs(10))
        .await;

    sleep(Duration::from_secs(3)).await;
    Expected::Exactly(vec![]).check(&network.peers_of(0).await);

    network.stop().await;
}

#[tokio::test]
pub async fn blocked_network_is_never_dialled() {
    let network = Network::start([
        TestNode::correct(vec![1])
            .with(|builder| builder.block_network("127.0.0.0/8".parse().unwrap())),
        TestNode::correct(vec![]),
    ])
    .await;

    sleep(Duration::from_secs(3)).await;

    Expected::Exactly(vec![]).check(&network.peers_of(0).await);

    network.stop().await;
}
