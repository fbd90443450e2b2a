use std::time::Duration;

use pricefeed_network_test::{Expected, Network, TestNode};
use tokio::time::sleep;

// Node 1 discovers node 0 and keeps a direct connection to node 2,
// node 2 only knows node 1 and must never learn about node 0:
//     0 <--- 1 <--> 2
#[tokio::test]
pub async fn discovery_does_not_leak_peers() {
    let network = Network::start([
        TestNode::correct(vec![]),
        TestNode::correct(vec![2]).discovering(vec![0]),
        TestNode::correct(vec![1]),
    ])
    .await;

    network
        .wait_for_peers(1, Expected::Exactly(vec![0, 2]), Duration::from_secs(10))
        .await;

    sleep(Duration::from_secs(3)).await;

    Expected::Exactly(vec![1]).check(&network.peers_of(0).await);
    Expected::Exactly(vec![1]).check(&network.peers_of(2).await);

    network.stop().await;
}

#[tokio::test]
pub async fn bootstrap_set_with_self() {
    let network = Network::start([
        TestNode::correct(vec![]).discovering(vec![0, 1]),
        TestNode::correct(vec![]).discovering(vec![0, 1]),
    ])
    .await;

    network
        .wait_for_peers(0, Expected::Exactly(vec![1]), Duration::from_secs(10))
        .await;
    network
        .wait_for_peers(1, Expected::Exactly(vec![0]), Duration::from_secs(10))
        .await;

    network.stop().await;
}
