//! Owner failover in the middle of a job.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keel_core::kv::{KeyRange, Snapshot};
use keel_ddl::model::{IndexDef, JobArgs, JobState, SchemaState};
use keel_ddl::table::codec;
use keel_test_utils::{
    abc_table, assert_index_consistent, assert_job_done, assert_monotonic_path, fill_abc,
    init_test_logging, TestCluster,
};

const ROWS: i64 = 200;

fn add_idx_c() -> JobArgs {
    JobArgs::AddIndex {
        index: IndexDef::new("idx_c", ["c"]),
    }
}

/// Index keys with the table and index IDs stripped, so runs on different
/// clusters compare equal.
async fn index_suffixes(cluster: &TestCluster) -> Vec<Bytes> {
    let table = cluster
        .nodes()
        .iter()
        .find_map(|n| n.info_schema().ok())
        .expect("a live node")
        .table_by_name("test", "t")
        .expect("table");
    let index = table.find_index("idx_c").expect("idx_c");
    assert_eq!(index.state, SchemaState::Public);
    assert_index_consistent(&cluster.store(), &table, "idx_c").await;

    let prefix = codec::index_prefix(table.id, index.id);
    Snapshot::latest(cluster.store())
        .await
        .expect("snapshot")
        .scan_all(&KeyRange::prefix(&prefix))
        .await
        .expect("scan")
        .into_iter()
        .map(|(key, _)| key.slice(prefix.len()..))
        .collect()
}

async fn seeded_cluster() -> TestCluster {
    let cluster = TestCluster::start(3).await.expect("cluster");
    cluster.create_table("test", abc_table("t")).await.expect("create");
    fill_abc(&cluster.session(0, "test"), "t", 0..ROWS).await.expect("fill");
    cluster
}

#[tokio::test]
async fn killed_owner_mid_backfill_yields_same_index() {
    init_test_logging();

    // 1. Uninterrupted baseline.
    let baseline = seeded_cluster().await;
    let job = baseline.alter(0, "test", "t", add_idx_c()).await.expect("baseline");
    assert_job_done(&job);
    let expected = index_suffixes(&baseline).await;
    assert_eq!(expected.len(), usize::try_from(ROWS).unwrap());
    baseline.shutdown().await.expect("shutdown");

    // 2. Same change, owner killed after the first committed chunk.
    let cluster = seeded_cluster().await;
    let owner = cluster.owner(Duration::from_secs(5)).await.expect("owner");
    let victim = Arc::clone(&owner);
    cluster.hook().on_first_backfill_chunk(move |_job| {
        let victim = Arc::clone(&victim);
        async move {
            victim.kill();
            Ok(())
        }
    });

    let submitter = cluster
        .nodes()
        .iter()
        .find(|n| n.id() != owner.id())
        .map(Arc::clone)
        .expect("a non-owner node");
    let id = submitter
        .submit(submitter.request("test", "t", add_idx_c()).expect("request"))
        .await
        .expect("submit");

    let successor = cluster
        .new_owner(&owner, Duration::from_secs(10))
        .await
        .expect("another node takes over");
    assert_ne!(successor.id(), owner.id());

    let job = submitter
        .wait_for_job(id, Duration::from_secs(30))
        .await
        .expect("job finishes under the new owner");
    assert_job_done(&job);
    assert_eq!(job.row_count, ROWS, "checkpointed chunks were counted once");
    assert_monotonic_path(job.job_type, &cluster.hook().transitions(id));
    assert!(
        cluster
            .hook()
            .transitions(id)
            .iter()
            .all(|(state, _)| *state != JobState::RollingBack),
        "failover must not roll the job back"
    );

    // 3. The index matches the baseline entry for entry.
    let actual = index_suffixes(&cluster).await;
    assert_eq!(actual, expected);
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn resigned_owner_hands_over_promptly() {
    init_test_logging();
    let mut cluster = TestCluster::start(2).await.expect("cluster");
    cluster.create_table("test", abc_table("t")).await.expect("create");
    let owner = cluster.owner(Duration::from_secs(5)).await.expect("owner");
    owner.shutdown().await.expect("shutdown owner");

    // Resigning releases the lease, so the peer does not wait for expiry.
    let successor = cluster
        .new_owner(&owner, Duration::from_secs(5))
        .await
        .expect("successor");
    let late = cluster.add_node().await.expect("third node");
    assert!(!late.is_owner());

    let n = cluster
        .nodes()
        .iter()
        .position(|node| node.id() == successor.id())
        .expect("successor is a member");
    let job = cluster
        .alter(n, "test", "t", JobArgs::RenameTable { new_name: "u".into() })
        .await
        .expect("rename under the successor");
    assert_job_done(&job);
    cluster.shutdown().await.expect("shutdown");
}
