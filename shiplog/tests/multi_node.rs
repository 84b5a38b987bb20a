//! Multi-node replication tests: gossip join, leader writes, follower
//! reads, and graceful removal.

mod common;

use common::TestNode;
use shiplog::proto::ConsumeRequest;
use shiplog_client::LogClient;
use std::time::Duration;

/// Start a 3-node cluster: the first bootstraps, the rest join via gossip.
async fn start_cluster() -> Vec<TestNode> {
    let first = TestNode::start("1", true, Vec::new(), None).await;
    let seed = first.bind_addr.clone();
    let second = TestNode::start("2", false, vec![seed.clone()], None).await;
    let third = TestNode::start("3", false, vec![seed], None).await;

    // Discovery plus two membership changes need a moment to settle.
    tokio::time::sleep(Duration::from_secs(3)).await;
    vec![first, second, third]
}

#[tokio::test]
async fn records_replicate_to_every_follower() {
    let nodes = start_cluster().await;

    let leader_client = LogClient::connect(&nodes[0].rpc_addr)
        .await
        .expect("connect");
    let offset = leader_client
        .produce(b"replicated".to_vec())
        .await
        .expect("produce");

    // The cluster should converge well inside this bound.
    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in &nodes {
        let mut client = node.rpc_client().await;
        let response = client
            .consume(ConsumeRequest { offset })
            .await
            .expect("consume")
            .into_inner();
        let record = response.record.expect("record");
        assert_eq!(record.value, b"replicated");
        assert_eq!(record.offset, offset);
    }

    // The leader must not observe a ghost second record (no replication
    // cycles back into the leader).
    let mut leader = nodes[0].rpc_client().await;
    let status = leader
        .consume(ConsumeRequest { offset: offset + 1 })
        .await
        .err()
        .expect("must fail");
    assert_eq!(status.code(), tonic::Code::OutOfRange);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn topology_reaches_resolver_and_produce_routes_to_leader() {
    let nodes = start_cluster().await;

    // Connect to a follower; the resolver must discover all three servers
    // and the picker must still land the write on the leader.
    let client = LogClient::connect(&nodes[1].rpc_addr)
        .await
        .expect("connect");
    let servers = client.get_servers().await.expect("get servers");
    assert_eq!(servers.len(), 3);
    assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);

    let offset = client
        .produce(b"via follower".to_vec())
        .await
        .expect("produce");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let record = client.consume(offset).await.expect("consume");
    assert_eq!(record.value, b"via follower");

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn departed_follower_stops_observing_appends() {
    let nodes = start_cluster().await;

    let leader_client = LogClient::connect(&nodes[0].rpc_addr)
        .await
        .expect("connect");
    let first = leader_client
        .produce(b"before leave".to_vec())
        .await
        .expect("produce");
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Remove the second node from the voter set.
    nodes[0].agent.log().leave("2").await.expect("leave");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let third = leader_client
        .produce(b"third".to_vec())
        .await
        .expect("produce");
    assert_eq!(third, first + 1);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The departed node never sees the new record.
    let mut departed = nodes[1].rpc_client().await;
    let status = departed
        .consume(ConsumeRequest { offset: third })
        .await
        .err()
        .expect("must fail");
    assert_eq!(status.code(), tonic::Code::OutOfRange);

    // The remaining follower does.
    let mut remaining = nodes[2].rpc_client().await;
    let response = remaining
        .consume(ConsumeRequest { offset: third })
        .await
        .expect("consume")
        .into_inner();
    assert_eq!(response.record.expect("record").value, b"third");

    for node in &nodes {
        node.shutdown().await;
    }
}
