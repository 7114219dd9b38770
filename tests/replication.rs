//! Replicated volumes: group membership and active-array exports

mod support;

use support::{block_backend, Cluster};
use volplane::backend::sim::FailureKind;
use volplane::common::{BackendConfig, ReplicationConfig, ReplicationMode};
use volplane::coordinator::metadata::RcgInfo;
use volplane::coordinator::replication::{RcgRole, RcgState};
use volplane::{CreateOptions, Error};

fn replicated_backend(peer_persistence: bool) -> BackendConfig {
    let mut backend = block_backend("primary");
    backend.replication = Some(ReplicationConfig {
        remote_array: "secondary".into(),
        mode: ReplicationMode::Synchronous,
        peer_persistence,
    });
    backend
}

fn in_group(group: &str) -> CreateOptions {
    CreateOptions {
        size_gib: Some(10),
        replication_group: Some(group.into()),
        ..Default::default()
    }
}

/// Replicated volume whose remote copy exists on the secondary array
async fn replicated_volume(cluster: &Cluster, node: &support::Node, name: &str) {
    node.orch
        .create_volume(name, None, in_group("grp"))
        .await
        .unwrap();
    cluster.array("secondary").add_volume(name, 10, "FC_r6");
}

#[tokio::test]
async fn test_volumes_join_group() {
    let cluster = Cluster::new(vec![replicated_backend(false)]);
    let node = cluster.node("node-a").await;
    let primary = cluster.array("primary");

    node.orch
        .create_volume("vol1", None, in_group("grp"))
        .await
        .unwrap();
    let record = node.orch.get_volume("vol1").await.unwrap();
    assert_eq!(
        record.rcg_info,
        Some(RcgInfo {
            local_rcg_name: "grp".into(),
            remote_rcg_name: "grp.r".into(),
        })
    );
    assert!(primary.has_rcg("grp"));
    assert_eq!(primary.rcg_volumes("grp"), vec!["vol1".to_string()]);

    // The existing group is stopped, extended and restarted
    node.orch
        .create_volume("vol2", None, in_group("grp"))
        .await
        .unwrap();
    assert_eq!(primary.call_count("create_rcg"), 1);
    assert_eq!(primary.call_count("stop_rcg"), 1);
    assert_eq!(primary.call_count("start_rcg"), 2);
    assert_eq!(
        primary.rcg_volumes("grp"),
        vec!["vol1".to_string(), "vol2".to_string()]
    );
}

#[tokio::test]
async fn test_failed_join_rolls_back_volume_and_group() {
    let cluster = Cluster::new(vec![replicated_backend(false)]);
    let node = cluster.node("node-a").await;
    let primary = cluster.array("primary");
    primary.fail_once("add_volume_to_rcg", FailureKind::Unavailable);

    let err = node
        .orch
        .create_volume("vol1", None, in_group("grp"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
    assert!(!primary.has_volume("vol1"));
    assert!(!primary.has_rcg("grp"));
    assert!(node.orch.get_volume("vol1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_group_requires_replication_config() {
    let cluster = Cluster::new(vec![block_backend("plain")]);
    let node = cluster.node("node-a").await;

    let err = node
        .orch
        .create_volume("vol1", None, in_group("grp"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
    assert!(!cluster.array("plain").has_volume("vol1"));
    assert!(node.orch.get_volume("vol1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_peer_persistence_exports_on_both_arrays() {
    let cluster = Cluster::new(vec![replicated_backend(true)]);
    let node = cluster.node("node-a").await;
    replicated_volume(&cluster, &node, "vol1").await;
    let (primary, secondary) = (cluster.array("primary"), cluster.array("secondary"));

    let path = node.orch.mount_volume("vol1", "m1").await.unwrap();
    assert!(path.export.starts_with("primary:"));
    assert_eq!(primary.exports_of("vol1"), vec!["node-a".to_string()]);
    assert_eq!(secondary.exports_of("vol1"), vec!["node-a".to_string()]);

    node.orch.unmount_volume("vol1", "m1").await.unwrap();
    assert!(primary.exports_of("vol1").is_empty());
    assert!(secondary.exports_of("vol1").is_empty());
}

#[tokio::test]
async fn test_mount_follows_failover() {
    let cluster = Cluster::new(vec![replicated_backend(false)]);
    let node = cluster.node("node-a").await;
    replicated_volume(&cluster, &node, "vol1").await;
    let (primary, secondary) = (cluster.array("primary"), cluster.array("secondary"));
    secondary.set_rcg_state("grp.r", RcgState::new(RcgRole::PrimaryReversed, true));

    let path = node.orch.mount_volume("vol1", "m1").await.unwrap();
    assert!(path.export.starts_with("secondary:"));
    assert!(primary.exports_of("vol1").is_empty());
    assert_eq!(secondary.exports_of("vol1"), vec!["node-a".to_string()]);

    node.orch.unmount_volume("vol1", "m1").await.unwrap();
    assert!(secondary.exports_of("vol1").is_empty());
}

#[tokio::test]
async fn test_mount_rejected_while_roles_change() {
    let cluster = Cluster::new(vec![replicated_backend(false)]);
    let node = cluster.node("node-a").await;
    replicated_volume(&cluster, &node, "vol1").await;
    // Both sides claim to be the unreversed primary
    cluster
        .array("secondary")
        .set_rcg_state("grp.r", RcgState::new(RcgRole::Primary, false));

    let err = node.orch.mount_volume("vol1", "m1").await.unwrap_err();
    assert!(matches!(err, Error::StateInTransition(_)));
    assert!(err.is_retryable());
    assert!(!node.orch.get_volume("vol1").await.unwrap().is_mounted());
    assert!(node.host.devices().is_empty());
}

#[tokio::test]
async fn test_unreachable_local_array_uses_remote_primary() {
    let cluster = Cluster::new(vec![replicated_backend(false)]);
    let node = cluster.node("node-a").await;
    replicated_volume(&cluster, &node, "vol1").await;
    let secondary = cluster.array("secondary");
    secondary.set_rcg_state("grp.r", RcgState::new(RcgRole::Primary, true));
    cluster.array("primary").set_reachable(false);

    let path = node.orch.mount_volume("vol1", "m1").await.unwrap();
    assert!(path.export.starts_with("secondary:"));
    assert_eq!(secondary.exports_of("vol1"), vec!["node-a".to_string()]);
}

#[tokio::test]
async fn test_no_answer_from_either_side() {
    let cluster = Cluster::new(vec![replicated_backend(false)]);
    let node = cluster.node("node-a").await;
    replicated_volume(&cluster, &node, "vol1").await;
    cluster.array("primary").set_reachable(false);

    let err = node.orch.mount_volume("vol1", "m1").await.unwrap_err();
    assert!(matches!(err, Error::CannotDetermineActive(_)));
}

#[tokio::test]
async fn test_delete_leaves_group() {
    let cluster = Cluster::new(vec![replicated_backend(false)]);
    let node = cluster.node("node-a").await;
    let primary = cluster.array("primary");
    replicated_volume(&cluster, &node, "vol1").await;
    replicated_volume(&cluster, &node, "vol2").await;

    node.orch.delete_volume("vol1").await.unwrap();
    assert!(!primary.has_volume("vol1"));
    assert_eq!(primary.rcg_volumes("grp"), vec!["vol2".to_string()]);
    assert!(node.orch.get_volume("vol1").await.unwrap_err().is_not_found());
}
