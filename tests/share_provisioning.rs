//! File share provisioning: FPG/VFS/IP placement and rollback

mod support;

use std::time::Duration;
use support::{file_backend, ip_pool, Cluster};
use volplane::backend::mediator::ArrayFpg;
use volplane::backend::sim::FailureKind;
use volplane::coordinator::lock::names;
use volplane::coordinator::metadata::{VolumeStatus, MAX_SHARES_PER_FPG};
use volplane::{CreateOptions, CreateOutcome, Error};

const CPG: &str = "FC_r6";

fn quota(size_gib: u64) -> CreateOptions {
    CreateOptions {
        size_gib: Some(size_gib),
        ..Default::default()
    }
}

fn legacy_fpg(cpg: &str, ip: &str) -> ArrayFpg {
    ArrayFpg {
        name: "legacy".into(),
        cpg: cpg.into(),
        size_tib: 4,
        vfs: Some(("legacy_vfs".into(), ip.into())),
    }
}

async fn create(node: &support::Node, name: &str, opts: CreateOptions) -> volplane::Result<()> {
    node.orch.create_share(name, None, opts).await?.finish().await
}

#[tokio::test]
async fn test_share_create_is_async() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(4))]);
    let node = cluster.node("node-a").await;

    let outcome = node.orch.create_share("s1", None, quota(10)).await.unwrap();
    let CreateOutcome::Pending(creation) = outcome else {
        panic!("share creation should run in the background");
    };
    assert_eq!(
        node.orch.get_share("s1").await.unwrap().status,
        VolumeStatus::Creating
    );
    creation.wait().await.unwrap();

    let record = node.orch.get_share("s1").await.unwrap();
    assert_eq!(record.status, VolumeStatus::Available);
    let share = record.share.unwrap();
    assert_eq!(share.fpg, "Fpg_1");
    assert_eq!(share.vfs, "Vfs_1");
    assert!(ip_pool(4).contains(&share.vfs_ip));

    let array = cluster.array("file");
    assert!(array.has_share("Fpg_1", "s1"));
    assert_eq!(array.quota_of("Fpg_1", "s1"), Some(10));
    assert_eq!(array.vfs_ips(), vec![share.vfs_ip.clone()]);

    let meta = cluster.metadata();
    let fpg = meta.get_fpg("file", CPG, "Fpg_1").await.unwrap().unwrap();
    assert_eq!(fpg.share_cnt, 1);
    let backend = meta.get_backend_metadata("file").await.unwrap().unwrap();
    assert_eq!(backend.default_fpgs.get(CPG).map(String::as_str), Some("Fpg_1"));
    assert!(backend.ips_in_use.contains(&share.vfs_ip));
    assert!(backend.ips_locked_for_use.is_empty());
}

#[tokio::test]
async fn test_duplicate_share_create() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(4))]);
    let node = cluster.node("node-a").await;

    let (first, second) = tokio::join!(
        node.orch.create_share("s1", None, quota(1)),
        node.orch.create_share("s1", None, quota(1))
    );
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_duplicate()).count(), 1);
    for outcome in outcomes {
        outcome.finish().await.unwrap();
    }
    assert_eq!(node.orch.list_shares().await.unwrap().len(), 1);
    assert_eq!(cluster.array("file").call_count("create_share"), 1);
}

#[tokio::test]
async fn test_full_fpg_spills_onto_new_fpg() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(4))]);
    let node = cluster.node("node-a").await;

    for i in 0..=MAX_SHARES_PER_FPG {
        create(&node, &format!("s{}", i), quota(1)).await.unwrap();
    }

    for i in 0..MAX_SHARES_PER_FPG {
        let record = node.orch.get_share(&format!("s{}", i)).await.unwrap();
        assert_eq!(record.share.unwrap().fpg, "Fpg_1");
    }
    let last = node
        .orch
        .get_share(&format!("s{}", MAX_SHARES_PER_FPG))
        .await
        .unwrap();
    assert_eq!(last.share.unwrap().fpg, "Fpg_2");

    let meta = cluster.metadata();
    let first = meta.get_fpg("file", CPG, "Fpg_1").await.unwrap().unwrap();
    assert_eq!(first.share_cnt, MAX_SHARES_PER_FPG);
    assert!(first.reached_full_capacity);
    let second = meta.get_fpg("file", CPG, "Fpg_2").await.unwrap().unwrap();
    assert_eq!(second.share_cnt, 1);

    let backend = meta.get_backend_metadata("file").await.unwrap().unwrap();
    assert_eq!(backend.default_fpgs.get(CPG).map(String::as_str), Some("Fpg_2"));
    assert_eq!(backend.ips_in_use.len(), 2);
    assert_eq!(
        cluster.array("file").fpg_names(),
        vec!["Fpg_1".to_string(), "Fpg_2".to_string()]
    );

    // Emptying the old FPG retires it; the default stays
    for i in 0..MAX_SHARES_PER_FPG {
        node.orch.delete_share(&format!("s{}", i)).await.unwrap();
    }
    assert_eq!(cluster.array("file").fpg_names(), vec!["Fpg_2".to_string()]);
    assert!(meta.get_fpg("file", CPG, "Fpg_1").await.unwrap().is_none());
    let backend = meta.get_backend_metadata("file").await.unwrap().unwrap();
    assert_eq!(backend.ips_in_use.len(), 1);
}

#[tokio::test]
async fn test_fpg_name_collision_takes_next_name() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(4))]);
    let array = cluster.array("file");
    array.add_fpg(ArrayFpg {
        name: "Fpg_1".into(),
        cpg: "other".into(),
        size_tib: 1,
        vfs: None,
    });
    let node = cluster.node("node-a").await;

    create(&node, "s1", quota(1)).await.unwrap();
    let share = node.orch.get_share("s1").await.unwrap().share.unwrap();
    assert_eq!(share.fpg, "Fpg_2");
    assert_eq!(array.call_count("create_fpg"), 2);
}

#[tokio::test]
async fn test_ip_exhaustion_rolls_back_new_fpg() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(1))]);
    let array = cluster.array("file");
    // The only pool address is already bound on the array
    array.add_fpg(legacy_fpg(CPG, "10.0.0.1"));
    let node = cluster.node("node-a").await;

    let err = create(&node, "s1", quota(1)).await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted(_)));

    let record = node.orch.get_share("s1").await.unwrap();
    assert_eq!(record.status, VolumeStatus::Failed);
    assert!(record.error.unwrap().contains("exhausted"));
    assert_eq!(array.fpg_names(), vec!["legacy".to_string()]);

    let meta = cluster.metadata();
    assert!(meta.list_fpgs("file").await.unwrap().is_empty());
    let backend = meta.get_backend_metadata("file").await.unwrap().unwrap();
    assert!(backend.default_fpgs.is_empty());
    assert!(backend.ips_locked_for_use.is_empty());
    assert!(backend.ips_in_use.is_empty());
}

#[tokio::test]
async fn test_vfs_failure_releases_address() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    let array = cluster.array("file");
    array.fail_once("create_vfs", FailureKind::Unavailable);
    let node = cluster.node("node-a").await;

    let err = create(&node, "s1", quota(1)).await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
    assert!(array.fpg_names().is_empty());
    let backend = cluster
        .metadata()
        .get_backend_metadata("file")
        .await
        .unwrap()
        .unwrap();
    assert!(backend.ips_locked_for_use.is_empty());
    assert!(backend.ips_in_use.is_empty());
    assert!(backend.default_fpgs.is_empty());

    // Names are never reused
    create(&node, "s2", quota(1)).await.unwrap();
    let share = node.orch.get_share("s2").await.unwrap().share.unwrap();
    assert_eq!(share.fpg, "Fpg_2");
}

#[tokio::test]
async fn test_share_on_legacy_fpg() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    let array = cluster.array("file");
    array.add_fpg(legacy_fpg(CPG, "192.168.1.5"));
    let node = cluster.node("node-a").await;

    let pinned = CreateOptions {
        fpg: Some("legacy".into()),
        ..Default::default()
    };
    create(&node, "s1", pinned.clone()).await.unwrap();
    let share = node.orch.get_share("s1").await.unwrap().share.unwrap();
    assert_eq!(share.fpg, "legacy");
    assert_eq!(share.vfs_ip, "192.168.1.5");
    assert_eq!(array.call_count("create_fpg"), 0);

    let fpg = cluster
        .metadata()
        .get_fpg("file", CPG, "legacy")
        .await
        .unwrap()
        .unwrap();
    assert!(fpg.legacy);
    assert_eq!(fpg.share_cnt, 1);

    // The pinned FPG must belong to the requested CPG
    let wrong_cpg = CreateOptions {
        cpg: Some("SSD_r1".into()),
        ..pinned
    };
    let err = create(&node, "s2", wrong_cpg).await.unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));
    assert_eq!(
        node.orch.get_share("s2").await.unwrap().status,
        VolumeStatus::Failed
    );
}

#[tokio::test]
async fn test_delete_share() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    let node = cluster.node("node-a").await;
    create(&node, "s1", quota(5)).await.unwrap();
    create(&node, "s2", quota(5)).await.unwrap();

    node.orch.delete_share("s1").await.unwrap();
    assert!(node.orch.get_share("s1").await.unwrap_err().is_not_found());
    let array = cluster.array("file");
    assert!(!array.has_share("Fpg_1", "s1"));
    assert!(array.has_share("Fpg_1", "s2"));
    let fpg = cluster
        .metadata()
        .get_fpg("file", CPG, "Fpg_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fpg.share_cnt, 1);

    // The default FPG is kept even when empty
    node.orch.delete_share("s2").await.unwrap();
    assert_eq!(array.fpg_names(), vec!["Fpg_1".to_string()]);
}

#[tokio::test]
async fn test_mount_share() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    let node = cluster.node("node-a").await;
    create(&node, "s1", quota(5)).await.unwrap();
    let share = node.orch.get_share("s1").await.unwrap().share.unwrap();

    let path = node.orch.mount_share("s1", "m1").await.unwrap();
    assert_eq!(path.export, format!("{}:{}", share.vfs_ip, share.share_path));
    assert!(path.device_path.is_none());
    assert!(node.host.is_mounted(&path.mount_dir));
    let array = cluster.array("file");
    assert_eq!(array.share_clients("Fpg_1", "s1"), vec!["node-a".to_string()]);

    node.orch.unmount_share("s1", "m1").await.unwrap();
    assert!(!node.host.is_mounted(&path.mount_dir));
    assert!(array.share_clients("Fpg_1", "s1").is_empty());
}

#[tokio::test]
async fn test_failed_share_cannot_mount_but_can_delete() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    cluster
        .array("file")
        .fail_once("create_share", FailureKind::BadRequest);
    let node = cluster.node("node-a").await;

    assert!(create(&node, "s1", quota(1)).await.is_err());
    // The FPG built for s1 alone goes away with it
    assert!(cluster.array("file").fpg_names().is_empty());
    let backend = cluster
        .metadata()
        .get_backend_metadata("file")
        .await
        .unwrap()
        .unwrap();
    assert!(backend.default_fpgs.is_empty());
    assert!(backend.ips_in_use.is_empty());
    assert!(backend.ips_locked_for_use.is_empty());

    let err = node.orch.mount_share("s1", "m1").await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));

    node.orch.delete_share("s1").await.unwrap();
    assert!(node.orch.get_share("s1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_shutdown_waits_for_workers() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    let node = cluster.node("node-a").await;

    let outcome = node.orch.create_share("s1", None, quota(1)).await.unwrap();
    drop(outcome);
    node.orch.shutdown().await;

    assert_eq!(
        node.orch.get_share("s1").await.unwrap().status,
        VolumeStatus::Available
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_share_keeps_fpg_used_by_others() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    let node = cluster.node("node-a").await;
    let meta = cluster.metadata();

    // s1 builds Fpg_1, then stalls on its own lock until it times out
    let first = node.orch.create_share("s1", None, quota(1)).await.unwrap();
    node.orch.locks().try_lock(&names::share("s1")).await.unwrap();
    while meta
        .get_fpg("file", CPG, "Fpg_1")
        .await
        .unwrap()
        .map_or(true, |fpg| fpg.share_cnt == 0)
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    create(&node, "s2", quota(1)).await.unwrap();
    let err = first.finish().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let record = node.orch.get_share("s2").await.unwrap();
    assert_eq!(record.status, VolumeStatus::Available);
    let share = record.share.unwrap();
    assert_eq!(share.fpg, "Fpg_1");

    let array = cluster.array("file");
    assert_eq!(array.fpg_names(), vec!["Fpg_1".to_string()]);
    assert!(array.has_share("Fpg_1", "s2"));
    assert!(!array.has_share("Fpg_1", "s1"));
    let fpg = meta.get_fpg("file", CPG, "Fpg_1").await.unwrap().unwrap();
    assert_eq!(fpg.share_cnt, 1);
    let backend = meta.get_backend_metadata("file").await.unwrap().unwrap();
    assert_eq!(backend.default_fpgs.get(CPG).map(String::as_str), Some("Fpg_1"));
    assert!(backend.ips_in_use.contains(&share.vfs_ip));

    node.orch.locks().unlock(&names::share("s1")).await.unwrap();
}

/// Point the CPG default elsewhere so an emptied Fpg_1 gets retired
async fn demote_fpg_1(cluster: &Cluster) {
    let meta = cluster.metadata();
    let mut backend = meta.get_backend_metadata("file").await.unwrap().unwrap();
    backend.default_fpgs.insert(CPG.into(), "Fpg_other".into());
    meta.put_backend_metadata("file", &backend).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fpg_retirement_waits_for_slot_holder() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    let a = cluster.node("node-a").await;
    let b = cluster.node("node-b").await;
    create(&a, "s1", quota(1)).await.unwrap();
    demote_fpg_1(&cluster).await;

    let meta = cluster.metadata();
    let array = cluster.array("file");
    let cpg_lock = names::cpg("file", CPG);
    let fpg_lock = names::fpg("file", CPG, "Fpg_1");
    b.orch.locks().try_lock(&cpg_lock).await.unwrap();

    // node-b plays a worker holding the FPG lock to take a share slot
    let slot_holder = async {
        while a.orch.get_share("s1").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        b.orch.locks().try_lock(&fpg_lock).await.unwrap();
        b.orch.locks().unlock(&cpg_lock).await.unwrap();
        loop {
            let holder = b.orch.locks().holder_of(&cpg_lock).await.unwrap();
            if holder.is_some_and(|entry| entry.holder == "node-a") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(array.fpg_names(), vec!["Fpg_1".to_string()]);
        let mut fpg = meta.get_fpg("file", CPG, "Fpg_1").await.unwrap().unwrap();
        assert_eq!(fpg.share_cnt, 0);
        fpg.share_cnt += 1;
        meta.put_fpg("file", &fpg).await.unwrap();
        b.orch.locks().unlock(&fpg_lock).await.unwrap();
    };
    let (deleted, ()) = tokio::join!(a.orch.delete_share("s1"), slot_holder);
    deleted.unwrap();

    assert_eq!(array.fpg_names(), vec!["Fpg_1".to_string()]);
    let fpg = meta.get_fpg("file", CPG, "Fpg_1").await.unwrap().unwrap();
    assert_eq!(fpg.share_cnt, 1);
    let backend = meta.get_backend_metadata("file").await.unwrap().unwrap();
    assert_eq!(backend.ips_in_use.len(), 1);
}

#[tokio::test]
async fn test_pinned_create_on_retired_fpg_fails() {
    let cluster = Cluster::new(vec![file_backend("file", ip_pool(2))]);
    let node = cluster.node("node-a").await;
    create(&node, "s1", quota(1)).await.unwrap();
    demote_fpg_1(&cluster).await;

    node.orch.delete_share("s1").await.unwrap();
    let array = cluster.array("file");
    assert!(array.fpg_names().is_empty());
    let meta = cluster.metadata();
    assert!(meta.get_fpg("file", CPG, "Fpg_1").await.unwrap().is_none());
    let backend = meta.get_backend_metadata("file").await.unwrap().unwrap();
    assert!(backend.ips_in_use.is_empty());

    let pinned = CreateOptions {
        fpg: Some("Fpg_1".into()),
        ..Default::default()
    };
    let err = create(&node, "s2", pinned).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!array.has_share("Fpg_1", "s2"));
    assert_eq!(
        node.orch.get_share("s2").await.unwrap().status,
        VolumeStatus::Failed
    );
}
