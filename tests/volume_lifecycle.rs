//! End-to-end volume lifecycle through the CSI controller, backed by mock
//! storage nodes.

mod support;

use blockplane::csi_proto::controller_client::ControllerClient;
use blockplane::proto::ShareProtocolReplica;
use support::{create_volume_request, start_cluster, MockNode};
use tonic::Code;

const VOL_NAME: &str = "pvc-753b391c-9b04-4ce3-9c74-9d949152e547";
const VOL_UUID: &str = "753b391c-9b04-4ce3-9c74-9d949152e547";

#[tokio::test]
async fn test_create_volume_two_replicas() {
    let n1 = MockNode::new("n1");
    n1.add_pool("P1", 100, 0);
    let n2 = MockNode::new("n2");
    n2.add_pool("P2", 100, 0);
    let cluster = start_cluster(vec![n1, n2]).await;
    let mut client = ControllerClient::new(cluster.csi_channel().await);

    let reply = client
        .create_volume(create_volume_request(VOL_NAME, 64, 0, Some(2)))
        .await
        .unwrap()
        .into_inner();
    let volume = reply.volume.unwrap();
    assert_eq!(volume.volume_id, VOL_UUID);
    assert_eq!(volume.capacity_bytes, 64);

    // Exactly one node runs the nexus, and it is the advertised topology.
    let host = cluster.nexus_host(VOL_UUID).expect("nexus was created");
    assert_eq!(volume.accessible_topology.len(), 1);
    assert_eq!(
        volume.accessible_topology[0].segments["kubernetes.io/hostname"],
        host.name()
    );

    // One replica per node; local to the nexus stays private, the remote one
    // is exported over nvmf.
    for mock in cluster.nodes.values() {
        let state = mock.state();
        assert_eq!(state.replicas.len(), 1);
        let replica = state.replicas.values().next().unwrap();
        assert_eq!(replica.uuid, VOL_UUID);
        if mock.name() == host.name() {
            assert_eq!(replica.share, ShareProtocolReplica::ReplicaNone as i32);
        } else {
            assert_eq!(replica.share, ShareProtocolReplica::ReplicaNvmf as i32);
        }
    }
    assert_eq!(host.state().nexuses[VOL_UUID].children.len(), 2);

    // Re-issuing the same request is a no-op returning the same volume.
    let again = client
        .create_volume(create_volume_request(VOL_NAME, 64, 0, Some(2)))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert_eq!(again.volume_id, VOL_UUID);
    assert_eq!(again.capacity_bytes, 64);
    assert_eq!(host.state().nexuses[VOL_UUID].children.len(), 2);
}

#[tokio::test]
async fn test_create_volume_capacity_exhausted() {
    let n1 = MockNode::new("n1");
    n1.add_pool("P1", 100, 50);
    let cluster = start_cluster(vec![n1]).await;
    let mut client = ControllerClient::new(cluster.csi_channel().await);

    let status = client
        .create_volume(create_volume_request(VOL_NAME, 75, 0, None))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);
}

#[tokio::test]
async fn test_create_volume_rejects_foreign_modes() {
    use blockplane::csi_proto::volume_capability::{access_mode, AccessMode};

    let n1 = MockNode::new("n1");
    n1.add_pool("P1", 100, 0);
    let cluster = start_cluster(vec![n1]).await;
    let mut client = ControllerClient::new(cluster.csi_channel().await);

    let mut request = create_volume_request(VOL_NAME, 64, 0, None);
    request.volume_capabilities[0].access_mode = Some(AccessMode {
        mode: access_mode::Mode::MultiNodeMultiWriter as i32,
    });
    let status = client.create_volume(request).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let request = create_volume_request("not-a-pvc-name", 64, 0, None);
    let status = client.create_volume(request).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_delete_volume_is_idempotent() {
    let n1 = MockNode::new("n1");
    n1.add_pool("P1", 100, 0);
    let n2 = MockNode::new("n2");
    n2.add_pool("P2", 100, 0);
    let cluster = start_cluster(vec![n1, n2]).await;
    let mut client = ControllerClient::new(cluster.csi_channel().await);

    client
        .create_volume(create_volume_request(VOL_NAME, 64, 0, Some(2)))
        .await
        .unwrap();

    client
        .delete_volume(blockplane::csi_proto::DeleteVolumeRequest {
            volume_id: VOL_UUID.to_string(),
        })
        .await
        .unwrap();
    for mock in cluster.nodes.values() {
        let state = mock.state();
        assert!(state.replicas.is_empty());
        assert!(state.nexuses.is_empty());
    }

    // Again: nothing left to do, still OK.
    client
        .delete_volume(blockplane::csi_proto::DeleteVolumeRequest {
            volume_id: VOL_UUID.to_string(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shrinking_replica_count_trims() {
    let n1 = MockNode::new("n1");
    n1.add_pool("P1", 100, 0);
    let n2 = MockNode::new("n2");
    n2.add_pool("P2", 100, 0);
    let cluster = start_cluster(vec![n1, n2]).await;
    let mut client = ControllerClient::new(cluster.csi_channel().await);

    client
        .create_volume(create_volume_request(VOL_NAME, 64, 0, Some(2)))
        .await
        .unwrap();
    let host = cluster.nexus_host(VOL_UUID).unwrap().name().to_string();

    // Same volume, one replica: the excess child is removed and its replica
    // destroyed; the nexus-local replica survives.
    client
        .create_volume(create_volume_request(VOL_NAME, 64, 0, Some(1)))
        .await
        .unwrap();

    let total: usize = cluster
        .nodes
        .values()
        .map(|mock| mock.state().replicas.len())
        .sum();
    assert_eq!(total, 1);
    let host_mock = &cluster.nodes[&host];
    let state = host_mock.state();
    assert_eq!(state.replicas.len(), 1);
    assert_eq!(state.nexuses[VOL_UUID].children.len(), 1);
    assert_eq!(
        state.replicas.values().next().unwrap().share,
        ShareProtocolReplica::ReplicaNone as i32
    );
}

#[tokio::test]
async fn test_publish_idempotent_and_node_scoped() {
    let n1 = MockNode::new("n1");
    n1.add_pool("P1", 100, 0);
    let n2 = MockNode::new("n2");
    n2.add_pool("P2", 100, 0);
    let cluster = start_cluster(vec![n1, n2]).await;
    let mut client = ControllerClient::new(cluster.csi_channel().await);

    client
        .create_volume(create_volume_request(VOL_NAME, 64, 0, Some(1)))
        .await
        .unwrap();
    let host = cluster.nexus_host(VOL_UUID).unwrap().name().to_string();
    let other = cluster
        .nodes
        .keys()
        .find(|name| **name != host)
        .unwrap()
        .clone();

    let publish = |node: String| blockplane::csi_proto::ControllerPublishVolumeRequest {
        volume_id: VOL_UUID.to_string(),
        node_id: format!("mayastor://{}", node),
        volume_capability: Some(support::snw_capability()),
        readonly: false,
    };

    let first = client
        .controller_publish_volume(publish(host.clone()))
        .await
        .unwrap()
        .into_inner();
    let device_uri = first.publish_context["uri"].clone();
    assert!(!device_uri.is_empty());

    // Same node again: idempotent, same device.
    let second = client
        .controller_publish_volume(publish(host.clone()))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(second.publish_context["uri"], device_uri);

    // A different node is rejected.
    let status = client
        .controller_publish_volume(publish(other))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Readonly is rejected.
    let mut readonly = publish(host.clone());
    readonly.readonly = true;
    let status = client.controller_publish_volume(readonly).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Unpublish twice; both succeed.
    let unpublish = blockplane::csi_proto::ControllerUnpublishVolumeRequest {
        volume_id: VOL_UUID.to_string(),
        node_id: format!("mayastor://{}", host),
    };
    client
        .controller_unpublish_volume(unpublish.clone())
        .await
        .unwrap();
    client
        .controller_unpublish_volume(unpublish)
        .await
        .unwrap();
    assert!(cluster.nodes[&host].state().nexuses[VOL_UUID]
        .device_uri
        .is_empty());

    // Unpublishing a volume that never existed is NOT_FOUND.
    let status = client
        .controller_unpublish_volume(blockplane::csi_proto::ControllerUnpublishVolumeRequest {
            volume_id: "11111111-2222-4333-8444-555555555555".to_string(),
            node_id: format!("mayastor://{}", host),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}
