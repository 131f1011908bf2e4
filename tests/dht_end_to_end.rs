#[path = "common/mod.rs"]
mod common;

use common::{connect, make_node_id, TestNode};
use kadstore::sim::NetworkRegistry;
use kadstore::{hash_content, FindValueResponse};

#[tokio::test]
async fn iterative_find_node_returns_expected_contacts() {
    let registry = NetworkRegistry::new();
    let main = TestNode::new(registry.clone(), 0x10, 20, 3).await;
    let peer_one = TestNode::new(registry.clone(), 0x11, 20, 3).await;
    let peer_two = TestNode::new(registry.clone(), 0x12, 20, 3).await;

    for peer in [&peer_one, &peer_two] {
        connect(&main, peer).await;
    }

    let results = main
        .node
        .iterative_find_node(peer_two.id())
        .await
        .expect("lookup succeeds");

    assert_eq!(results.first().map(|c| c.id), Some(peer_two.id()));
    assert!(results.iter().any(|c| c.id == peer_one.id()));
    assert!(results.iter().all(|c| c.id != main.id()));
}

#[tokio::test]
async fn lookup_discovers_peers_beyond_direct_contacts() {
    let registry = NetworkRegistry::new();
    let main = TestNode::new(registry.clone(), 0x100, 20, 3).await;
    let hop = TestNode::new(registry.clone(), 0x200, 20, 3).await;
    let far = TestNode::new(registry.clone(), 0x300, 20, 3).await;

    connect(&main, &hop).await;
    connect(&hop, &far).await;

    let results = main
        .node
        .iterative_find_node(far.id())
        .await
        .expect("lookup succeeds");

    assert_eq!(results.first().map(|c| c.id), Some(far.id()));
    assert!(main.node.routing_table().contains(&far.id()));
}

#[tokio::test]
async fn iterative_find_value_fetches_remote_payload() {
    let registry = NetworkRegistry::new();
    let main = TestNode::new(registry.clone(), 0x20, 20, 3).await;
    let holder = TestNode::new(registry.clone(), 0x21, 20, 3).await;

    connect(&main, &holder).await;

    let value = b"hello routing".to_vec();
    let key = hash_content(&value);
    holder
        .node
        .handle_store_request(&main.contact(), key, value.clone())
        .await
        .expect("store accepted");

    let result = main
        .node
        .iterative_find_value(key)
        .await
        .expect("value lookup succeeds");
    let found = result.value.expect("value found");
    assert_eq!(found.value, value);
    assert_eq!(found.holder.id, holder.id());
}

#[tokio::test]
async fn unreachable_peer_is_skipped_by_lookups() {
    let registry = NetworkRegistry::new();
    let main = TestNode::new(registry.clone(), 0x30, 10, 3).await;
    let flaky = TestNode::new(registry.clone(), 0x31, 10, 3).await;
    let steady = TestNode::new(registry.clone(), 0x32, 10, 3).await;

    connect(&main, &flaky).await;
    connect(&main, &steady).await;

    main.network.set_failure(flaky.id(), true).await;
    let target = make_node_id(0xAA);
    let results = main
        .node
        .iterative_find_node(target)
        .await
        .expect("lookup tolerates a failing peer");
    assert!(results.iter().all(|c| c.id != flaky.id()));
    assert!(results.iter().any(|c| c.id == steady.id()));
    // Demoted, not forgotten.
    assert!(main.node.routing_table().contains(&flaky.id()));

    main.network.set_failure(flaky.id(), false).await;
    let results = main
        .node
        .iterative_find_node(target)
        .await
        .expect("lookup succeeds after recovery");
    assert!(results.iter().any(|c| c.id == flaky.id()));
}

#[tokio::test]
async fn put_and_get_flow_stores_and_retrieves_content() {
    let registry = NetworkRegistry::new();
    let writer = TestNode::new(registry.clone(), 0x40, 20, 3).await;
    let peer = TestNode::new(registry.clone(), 0x41, 20, 3).await;

    connect(&writer, &peer).await;

    let payload = b"end-to-end test".to_vec();
    let key = writer
        .node
        .put(payload.clone())
        .await
        .expect("put succeeds");
    assert_eq!(key, hash_content(&payload));

    let reader = TestNode::new(registry.clone(), 0x42, 20, 3).await;
    reader.node.observe_contact(peer.contact()).await;
    reader.node.observe_contact(writer.contact()).await;

    let retrieved = reader.node.get(&key).await.expect("get runs");
    assert_eq!(retrieved, Some(payload.clone()));

    let at_peer = peer
        .node
        .handle_find_value_request(&writer.contact(), key)
        .await;
    assert_eq!(at_peer, FindValueResponse::Found(payload));
}

#[tokio::test]
async fn put_record_reports_every_replica() {
    let registry = NetworkRegistry::new();
    let writer = TestNode::new(registry.clone(), 0x50, 4, 2).await;
    let mut peers = Vec::new();
    for index in 0x51..0x56 {
        let peer = TestNode::new(registry.clone(), index, 4, 2).await;
        connect(&writer, &peer).await;
        peers.push(peer);
    }

    let value = b"replicate me".to_vec();
    let key = hash_content(&value);
    let report = writer
        .node
        .put_record(key, value.clone())
        .await
        .expect("put succeeds");

    assert!(report.stored_locally);
    assert_eq!(report.replicas.len(), 4);
    assert!(report.failed.is_empty());

    let holders = peers
        .iter()
        .filter(|p| p.node.content_store().contains(&key).unwrap())
        .count();
    assert_eq!(holders, 4);
    assert_eq!(writer.network.rpc_stats().store, 4);
}
