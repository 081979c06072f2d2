//! Pool management through the registry's node handles.

mod support;

use support::{start_cluster, MockNode};

#[tokio::test]
async fn test_create_and_destroy_pool() {
    let n1 = MockNode::new("n1");
    n1.add_pool("P1", 100, 0);
    let cluster = start_cluster(vec![n1]).await;

    let node = cluster.registry.get_node("n1").await.unwrap();
    let info = node
        .create_pool("P2", vec!["/dev/vdb".to_string()])
        .await
        .unwrap();
    assert_eq!(info.name, "P2");
    assert!(cluster.registry.get_pool("n1", "P2").await.is_some());
    assert!(cluster.nodes["n1"].state().pools.contains_key("P2"));

    // Creating the same pool again adopts the existing one.
    let again = node
        .create_pool("P2", vec!["/dev/vdb".to_string()])
        .await
        .unwrap();
    assert_eq!(again.name, "P2");

    node.destroy_pool("P2").await.unwrap();
    assert!(cluster.registry.get_pool("n1", "P2").await.is_none());
    assert!(!cluster.nodes["n1"].state().pools.contains_key("P2"));

    // Destroying a pool that is already gone still succeeds.
    node.destroy_pool("P2").await.unwrap();

    // Capacity is back to the remaining pool.
    assert_eq!(cluster.registry.get_capacity(Some("n1")).await, 100);
}
