//! Concurrent submissions: conflict detection and per-table scheduling.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_ddl::error::Error;
use keel_ddl::model::{ColumnDef, ColumnPosition, FieldType, IndexDef, JobArgs, JobState, SchemaState};
use keel_test_utils::{
    abc_table, assert_index_consistent, assert_job_done, fill_abc, init_test_logging, HookEvent,
    TestCluster,
};
use tokio::sync::Notify;

fn add_index(name: &str, column: &str) -> JobArgs {
    JobArgs::AddIndex {
        index: IndexDef::new(name, [column]),
    }
}

fn add_column(name: &str) -> JobArgs {
    JobArgs::AddColumn {
        column: ColumnDef::new(name, FieldType::Int),
        position: ColumnPosition::Default,
    }
}

/// Parks the first job reaching `state` until the returned gate is notified.
fn park_at(cluster: &TestCluster, state: SchemaState) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    let parked = Arc::clone(&gate);
    cluster.hook().on_schema_state(state, move |_job| {
        let parked = Arc::clone(&parked);
        async move {
            parked.notified().await;
            Ok(())
        }
    });
    gate
}

#[tokio::test]
async fn same_index_name_from_two_nodes_succeeds_once() {
    init_test_logging();
    let cluster = TestCluster::start(2).await.expect("cluster");
    cluster.create_table("test", abc_table("t")).await.expect("create");
    fill_abc(&cluster.session(0, "test"), "t", 0..50).await.expect("fill");

    let (first, second) = tokio::join!(
        cluster.alter(0, "test", "t", add_index("idx_b", "b")),
        cluster.alter(1, "test", "t", add_index("idx_b", "c")),
    );

    let (done, failed) = match (first, second) {
        (Ok(job), Err(err)) | (Err(err), Ok(job)) => (job, err),
        other => panic!("expected exactly one success, got {other:?}"),
    };
    assert_job_done(&done);
    assert!(
        failed.to_string().contains("index already exists"),
        "unexpected error: {failed}"
    );

    let table = cluster
        .node(0)
        .info_schema()
        .expect("schema")
        .table_by_name("test", "t")
        .expect("table");
    assert_eq!(table.indexes.iter().filter(|i| i.name == "idx_b").count(), 1);
    assert_index_consistent(&cluster.store(), &table, "idx_b").await;
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn jobs_on_different_tables_run_side_by_side() {
    init_test_logging();
    let cluster = TestCluster::start(2).await.expect("cluster");
    for name in ["t1", "t2"] {
        cluster.create_table("test", abc_table(name)).await.expect("create");
        fill_abc(&cluster.session(0, "test"), name, 0..30).await.expect("fill");
    }

    // The first job to reach write-only waits for another job to finish; it
    // can only be released if the other table's job is not queued behind it.
    let hook = Arc::clone(cluster.hook());
    let overlapped = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&overlapped);
    cluster.hook().on_schema_state(SchemaState::WriteOnly, move |job| {
        let hook = Arc::clone(&hook);
        let seen = Arc::clone(&seen);
        async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while tokio::time::Instant::now() < deadline {
                let other_finished = hook.events().iter().any(|e| {
                    matches!(e, HookEvent::Finished { job_id, state: JobState::Done } if *job_id != job.id)
                });
                if other_finished {
                    seen.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(())
        }
    });

    let (a, b) = tokio::join!(
        cluster.alter(0, "test", "t1", add_index("idx_b", "b")),
        cluster.alter(1, "test", "t2", add_column("d")),
    );
    assert_job_done(&a.expect("t1 job"));
    assert_job_done(&b.expect("t2 job"));
    assert!(overlapped.load(Ordering::SeqCst), "one table's job waited for the other's");
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn second_job_on_a_busy_table_is_rejected() {
    init_test_logging();
    let cluster = TestCluster::start(2).await.expect("cluster");
    cluster.create_table("test", abc_table("t")).await.expect("create");
    let gate = park_at(&cluster, SchemaState::WriteOnly);

    let node = Arc::clone(cluster.node(0));
    let first = node
        .submit(node.request("test", "t", add_index("idx_b", "b")).expect("request"))
        .await
        .expect("submit");
    wait_for_state(&cluster, first, SchemaState::WriteOnly).await;

    // A different change on the same table.
    let err = cluster
        .alter(1, "test", "t", add_column("d"))
        .await
        .expect_err("table is busy");
    assert!(matches!(err, Error::TableBusy { .. }), "{err}");

    // The same index name gets the operation-specific error instead.
    let err = cluster
        .alter(1, "test", "t", add_index("idx_b", "c"))
        .await
        .expect_err("index name taken");
    assert!(matches!(err, Error::IndexExists { .. }), "{err}");

    gate.notify_one();
    assert_job_done(&node.wait_for_job(first, Duration::from_secs(10)).await.expect("first"));
    assert_job_done(&cluster.alter(1, "test", "t", add_column("d")).await.expect("retry"));
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn jobs_racing_a_drop_table_see_a_schema_change() {
    init_test_logging();
    let cluster = TestCluster::start(2).await.expect("cluster");
    cluster.create_table("test", abc_table("t")).await.expect("create");
    let gate = park_at(&cluster, SchemaState::WriteOnly);

    // Planned while the table is still public.
    let late = cluster
        .node(1)
        .request("test", "t", add_column("d"))
        .expect("request");

    let node = Arc::clone(cluster.node(0));
    let dropping = node
        .submit(node.request("test", "t", JobArgs::DropTable).expect("request"))
        .await
        .expect("submit");
    wait_for_state(&cluster, dropping, SchemaState::WriteOnly).await;

    let err = cluster.node(1).submit(late).await.expect_err("table is going away");
    assert!(matches!(err, Error::SchemaChanged), "{err}");
    assert!(err.is_retryable());

    gate.notify_one();
    assert_job_done(&node.wait_for_job(dropping, Duration::from_secs(10)).await.expect("drop"));
    cluster.shutdown().await.expect("shutdown");
}

async fn wait_for_state(cluster: &TestCluster, job: keel_core::id::JobId, state: SchemaState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cluster.hook().schema_states(job).contains(&state) {
        assert!(tokio::time::Instant::now() < deadline, "job {job} never reached {state}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
