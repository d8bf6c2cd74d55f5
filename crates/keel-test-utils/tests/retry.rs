//! Jobs under injected storage faults.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::id::JobId;
use keel_core::kv::MemoryStore;
use keel_ddl::config::RetryConfig;
use keel_ddl::model::{ColumnDef, ColumnPosition, FieldType, IndexDef, JobArgs};
use keel_ddl::node::Node;
use keel_test_utils::{
    abc_table, assert_index_consistent, assert_job_cancelled, assert_job_done, assert_monotonic_path,
    fast_config, fill_abc, init_test_logging, retry_statement, FaultConfig, FaultyStore,
    TestCluster,
};

const WAIT: Duration = Duration::from_secs(30);

async fn faulty_cluster(seed: u64, retry: RetryConfig) -> (TestCluster, Arc<FaultyStore>) {
    let store = FaultyStore::new(MemoryStore::shared(), seed);
    let config = keel_ddl::config::DdlConfig {
        retry,
        ..fast_config()
    };
    let cluster = TestCluster::with_store(store.as_store(), 2, config)
        .await
        .expect("cluster");
    cluster.create_table("test", abc_table("t")).await.expect("create");
    fill_abc(&cluster.session(0, "test"), "t", 0..80).await.expect("fill");
    (cluster, store)
}

async fn submit(node: &Arc<Node>, args: JobArgs) -> JobId {
    let request = &node.request("test", "t", args).expect("request");
    retry_statement(|| async move { node.submit(request.clone()).await })
        .await
        .expect("submit")
}

#[tokio::test]
async fn failed_step_commits_are_retried() {
    init_test_logging();
    let (cluster, store) = faulty_cluster(1, fast_config().retry).await;
    store.fail_next_commits("ddl/queue/", 3);

    let node = Arc::clone(cluster.node(1));
    let id = submit(
        &node,
        JobArgs::AddColumn {
            column: ColumnDef::new("d", FieldType::Int).default_value(7_i64),
            position: ColumnPosition::Default,
        },
    )
    .await;
    let job = node.wait_for_job(id, WAIT).await.expect("job finishes");

    assert_job_done(&job);
    assert_eq!(store.forced_remaining(), 0);
    assert_eq!(store.injected_failures(), 3);
    assert_monotonic_path(job.job_type, &cluster.hook().transitions(id));
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn add_index_survives_flaky_commits() {
    init_test_logging();
    let (cluster, store) = faulty_cluster(42, fast_config().retry).await;
    store.configure(FaultConfig::flaky_commits(0.3).touching("ddl/"));

    let node = Arc::clone(cluster.node(0));
    let id = submit(&node, JobArgs::AddIndex { index: IndexDef::new("idx_b", ["b"]) }).await;
    let job = node.wait_for_job(id, WAIT).await.expect("job finishes");
    store.configure(FaultConfig::no_faults());

    assert_job_done(&job);
    assert!(store.injected_failures() > 0, "no faults were injected");
    assert_eq!(job.row_count, 80);
    let table = node
        .info_schema()
        .expect("schema")
        .table_by_name("test", "t")
        .expect("table");
    assert_index_consistent(&cluster.store(), &table, "idx_b").await;
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn persistent_backfill_failures_roll_the_job_back() {
    init_test_logging();
    let retry = RetryConfig {
        max_attempts: 3,
        base_backoff_ms: 5,
        max_backoff_ms: 20,
    };
    let (cluster, store) = faulty_cluster(7, retry).await;
    // Every attempt to lay out the backfill fails.
    store.fail_next_commits("ddl/reorg/", 1_000);

    let node = Arc::clone(cluster.node(0));
    let id = submit(&node, JobArgs::AddIndex { index: IndexDef::new("idx_b", ["b"]) }).await;
    node.wait_for_job(id, WAIT).await.expect_err("job rolls back");

    let job = node.job(id).await.expect("read").expect("archived");
    assert_job_cancelled(&job, "injected commit failure");
    assert!(job.error_count >= 3, "{job:?}");
    assert_monotonic_path(job.job_type, &cluster.hook().transitions(id));

    let table = node
        .info_schema()
        .expect("schema")
        .table_by_name("test", "t")
        .expect("table");
    assert!(table.find_index("idx_b").is_none());
    cluster.shutdown().await.expect("shutdown");
}
