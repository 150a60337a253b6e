//! Reconciliation scenarios against an in-process cluster
//!
//! Each test drives the engine by hand: heartbeats, refresh and validation
//! passes are invoked directly instead of through the coordinator loops.

mod common;

use std::time::Duration;

use common::{meta, TestCluster};
use serde_json::json;
use tern_mesh::{Error, MismatchKind, RepairOutcome};
use tern_proto::{content_checksum, FileStatus};
use tokio::time::Instant;

#[tokio::test]
async fn test_add_replica_targets_least_loaded_node() {
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    cluster.seed("n1", "f1", 1, b"alpha").await;
    cluster.seed("n2", "f1", 1, b"alpha").await;
    cluster.warm_up();
    cluster.heartbeat_with_count("n1", 1);
    cluster.heartbeat_with_count("n2", 2);
    cluster.heartbeat_with_count("n3", 0);

    cluster.engine().refresh_all().await;
    let report = cluster.engine().validate().await;

    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(
        report.outcomes,
        vec![("f1".to_string(), RepairOutcome::Added { node: "n3".into() })]
    );

    let copied = cluster.record("n3", "f1").unwrap();
    let original = cluster.record("n1", "f1").unwrap();
    assert_eq!(copied.version, original.version);
    assert_eq!(copied.meta_crc, original.meta_crc);
    assert_eq!(copied.file_crc, original.file_crc);
    assert_eq!(copied.status, FileStatus::Live);
    assert_eq!(cluster.content("n3", "f1").await, "alpha");

    // The pass ends with a refresh, so the mesh already shows three holders
    assert!(report.refresh.is_some());
    assert_eq!(cluster.engine().mesh().get("f1").unwrap().replica_count(), 3);
}

#[tokio::test]
async fn test_add_replica_without_capacity_fails_softly() {
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.seed("n1", "f1", 1, b"alpha").await;
    cluster.seed("n2", "f1", 1, b"alpha").await;
    cluster.warm_up();

    cluster.engine().refresh_all().await;
    let report = cluster.engine().validate().await;

    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
    assert!(report.outcomes.is_empty());
    assert_eq!(cluster.coordinator.stats().repairs_failed, 1);
}

#[tokio::test]
async fn test_remove_excess_targets_most_loaded_holder() {
    let cluster = TestCluster::new(&["n1", "n2", "n3", "n4"]);
    for id in ["n1", "n2", "n3", "n4"] {
        cluster.seed(id, "f2", 1, b"beta").await;
    }
    cluster.warm_up();
    cluster.heartbeat_with_count("n1", 3);
    cluster.heartbeat_with_count("n2", 7);
    cluster.heartbeat_with_count("n3", 5);
    cluster.heartbeat_with_count("n4", 2);

    cluster.engine().refresh_all().await;
    let report = cluster.engine().validate().await;

    assert_eq!(
        report.outcomes,
        vec![("f2".to_string(), RepairOutcome::Removed { node: "n2".into() })]
    );
    assert!(cluster.record("n2", "f2").is_none());
    assert_eq!(cluster.holders("f2"), vec!["n1", "n3", "n4"]);
    assert_eq!(cluster.engine().mesh().get("f2").unwrap().replica_count(), 3);
}

#[tokio::test]
async fn test_version_fix_converges_on_highest_version() {
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    cluster.seed("n1", "f3", 1, b"old").await;
    cluster.seed("n2", "f3", 1, b"old").await;
    cluster.seed("n3", "f3", 2, b"new").await;
    cluster.warm_up();

    cluster.engine().refresh_all().await;
    assert_eq!(
        cluster.engine().detect_mismatch("f3"),
        Some(MismatchKind::Version)
    );

    // One replica is repaired per pass
    let first = cluster.engine().validate().await;
    assert_eq!(
        first.outcomes,
        vec![(
            "f3".to_string(),
            RepairOutcome::Fixed {
                node: "n1".into(),
                from: "n3".into(),
                kind: MismatchKind::Version,
            }
        )]
    );
    assert_eq!(cluster.record("n2", "f3").unwrap().version, 1);

    let second = cluster.engine().validate().await;
    assert_eq!(
        second.outcomes,
        vec![(
            "f3".to_string(),
            RepairOutcome::Fixed {
                node: "n2".into(),
                from: "n3".into(),
                kind: MismatchKind::Version,
            }
        )]
    );

    let reference = cluster.record("n3", "f3").unwrap();
    for id in ["n1", "n2", "n3"] {
        let record = cluster.record(id, "f3").unwrap();
        assert_eq!(record.version, 2, "{id}");
        assert_eq!(record.meta_crc, reference.meta_crc, "{id}");
        assert_eq!(record.file_crc, reference.file_crc, "{id}");
        assert_eq!(cluster.content(id, "f3").await, "new", "{id}");
    }

    assert_eq!(cluster.engine().detect_mismatch("f3"), None);
    let third = cluster.engine().validate().await;
    assert_eq!(third.attempted, 0);
    assert!(third.refresh.is_none());
}

#[tokio::test]
async fn test_content_fix_follows_majority() {
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    cluster.seed("n1", "f4", 1, b"corrupt").await;
    cluster.seed("n2", "f4", 1, b"good").await;
    cluster.seed("n3", "f4", 1, b"good").await;
    cluster.warm_up();

    cluster.engine().refresh_all().await;
    let report = cluster.engine().validate().await;

    assert_eq!(
        report.outcomes,
        vec![(
            "f4".to_string(),
            RepairOutcome::Fixed {
                node: "n1".into(),
                from: "n2".into(),
                kind: MismatchKind::FileCrc,
            }
        )]
    );
    assert_eq!(cluster.content("n1", "f4").await, "good");
    assert_eq!(cluster.engine().detect_mismatch("f4"), None);
}

#[tokio::test]
async fn test_meta_fix_keeps_faulty_content() {
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    let mut renamed = meta("f8");
    renamed.insert("name".into(), json!("renamed.txt"));
    cluster.seed("n1", "f8", 1, b"zeta").await;
    cluster.seed_with_meta("n2", "f8", 1, b"zeta", renamed).await;
    cluster.seed("n3", "f8", 1, b"zeta").await;
    cluster.warm_up();

    cluster.engine().refresh_all().await;
    assert_eq!(
        cluster.engine().detect_mismatch("f8"),
        Some(MismatchKind::MetaCrc)
    );

    let report = cluster.engine().validate().await;
    assert_eq!(
        report.outcomes,
        vec![(
            "f8".to_string(),
            RepairOutcome::Fixed {
                node: "n2".into(),
                from: "n1".into(),
                kind: MismatchKind::MetaCrc,
            }
        )]
    );

    let fixed = cluster.record("n2", "f8").unwrap();
    assert_eq!(fixed.meta, meta("f8"));
    assert_eq!(fixed.version, 1);
    assert_eq!(cluster.content("n2", "f8").await, "zeta");

    let reference = cluster.record("n1", "f8").unwrap();
    for id in ["n1", "n2", "n3"] {
        let record = cluster.record(id, "f8").unwrap();
        assert_eq!(record.version, reference.version, "{id}");
        assert_eq!(record.meta_crc, reference.meta_crc, "{id}");
        assert_eq!(record.file_crc, reference.file_crc, "{id}");
    }
    assert_eq!(cluster.engine().detect_mismatch("f8"), None);
}

#[tokio::test]
async fn test_version_fix_carries_empty_content() {
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    cluster.seed("n1", "f9", 2, b"").await;
    cluster.seed("n2", "f9", 2, b"").await;
    cluster.seed("n3", "f9", 1, b"stale").await;
    cluster.warm_up();

    cluster.engine().refresh_all().await;
    let first = cluster.engine().validate().await;
    assert_eq!(
        first.outcomes,
        vec![(
            "f9".to_string(),
            RepairOutcome::Fixed {
                node: "n3".into(),
                from: "n1".into(),
                kind: MismatchKind::Version,
            }
        )]
    );

    let fixed = cluster.record("n3", "f9").unwrap();
    assert_eq!(fixed.version, 2);
    assert_eq!(fixed.file_crc, content_checksum(&[]));
    assert!(cluster.content("n3", "f9").await.is_empty());

    // Nothing left to repair on the next pass
    assert_eq!(cluster.engine().detect_mismatch("f9"), None);
    let second = cluster.engine().validate().await;
    assert_eq!(second.attempted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_node_counts_as_empty() {
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.seed("n1", "f1", 1, b"alpha").await;
    cluster.seed("n2", "f2", 1, b"beta").await;
    cluster.add_stalled("n3");

    let engine = cluster.engine().clone();
    let start = Instant::now();
    let refresh = tokio::spawn(async move { engine.refresh_all().await });

    // Answers from healthy nodes land before the stalled query times out
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cluster.engine().mesh().get("f1").is_some());
    assert!(cluster.engine().mesh().get("f2").is_some());

    let report = refresh.await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(4), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

    assert_eq!(report.queried, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(cluster.coordinator.stats().query_failures, 1);

    let mesh = cluster.engine().mesh();
    assert_eq!(mesh.len(), 2);
    assert!(mesh.entries().all(|entry| !entry.is_held_by("n3")));
}

#[tokio::test]
async fn test_delete_tombstones_every_replica() {
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    for id in ["n1", "n2", "n3"] {
        cluster.seed(id, "f5", 7, b"gamma").await;
    }
    cluster.engine().refresh_all().await;
    assert_eq!(cluster.coordinator.list_files().len(), 1);

    let acknowledged = cluster.coordinator.delete_file("f5").await.unwrap();
    assert_eq!(acknowledged, 3);

    for id in ["n1", "n2", "n3"] {
        let record = cluster.record(id, "f5").unwrap();
        assert_eq!(record.version, 107, "{id}");
        assert_eq!(record.status, FileStatus::Deleted, "{id}");
        assert!(record.date_deleted.is_some(), "{id}");
    }
    assert!(cluster.coordinator.list_files().is_empty());
    assert!(!cluster.engine().registry().locks().is_locked("f5"));
}

#[tokio::test(start_paused = true)]
async fn test_delete_with_stalled_replica_is_partial() {
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.seed("n1", "f6", 1, b"delta").await;
    cluster.seed("n2", "f6", 1, b"delta").await;
    cluster.add_stalled("n3");
    cluster.engine().refresh_all().await;

    // The stalled node claims a replica it will never serve
    let claimed = cluster.record("n1", "f6").unwrap();
    cluster
        .engine()
        .ingest_node_snapshot("n3", [("f6".to_string(), claimed)].into_iter().collect());

    let start = Instant::now();
    let err = cluster.coordinator.delete_file("f6").await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_secs(5));

    match err {
        Error::Partial {
            operation,
            succeeded,
            failed,
        } => {
            assert_eq!(operation, "delete");
            assert_eq!(succeeded, vec!["n1", "n2"]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0, "n3");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cluster.record("n1", "f6").unwrap().version, 101);
    assert_eq!(cluster.record("n2", "f6").unwrap().version, 101);
}

#[tokio::test(start_paused = true)]
async fn test_delete_waits_for_repair_lock() {
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    for id in ["n1", "n2", "n3"] {
        cluster.seed(id, "f7", 1, b"epsilon").await;
    }
    cluster.engine().refresh_all().await;

    let locks = cluster.engine().registry().locks().clone();
    let guard = locks.try_acquire("f7").unwrap();

    let start = Instant::now();
    let err = cluster.coordinator.delete_file("f7").await.unwrap_err();
    assert!(matches!(err, Error::Busy(ref id) if id == "f7"));
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(cluster.record("n1", "f7").unwrap().status, FileStatus::Live);

    drop(guard);
    assert_eq!(cluster.coordinator.delete_file("f7").await.unwrap(), 3);
}
