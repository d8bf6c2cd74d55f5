//! Foreground statements interleaved with schema state changes.
//!
//! Each test parks a job right after it reaches a chosen state (every live
//! node has loaded the new version by then), runs statements against a
//! non-owner node, then lets the job finish and checks the result.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_ddl::error::Result;
use keel_ddl::model::{ColumnDef, ColumnPosition, Datum, FieldType, IndexDef, JobArgs, SchemaState};
use keel_ddl::node::Session;
use keel_ddl::table::codec;
use keel_test_utils::{
    abc_table, abc_table_indexed, assert_index_consistent, assert_job_done, assert_monotonic_path,
    assert_no_keys, assert_versions_increase, enum_table, fill_abc, init_test_logging,
    retry_statement, TestCluster,
};
use tokio::sync::oneshot;

/// Runs `statements` on `session` once the cluster reaches `state` and
/// reports their outcome on the returned channel.
fn at_state<F, Fut>(
    cluster: &TestCluster,
    state: SchemaState,
    session: Session,
    statements: F,
) -> oneshot::Receiver<Result<()>>
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let statements = Arc::new(statements);
    cluster.hook().on_schema_state(state, move |_job| {
        let tx = tx.lock().unwrap().take();
        let session = session.clone();
        let statements = Arc::clone(&statements);
        async move {
            let outcome = statements(session).await;
            if let Some(tx) = tx {
                let _ = tx.send(outcome);
            }
            Ok(())
        }
    });
    rx
}

#[tokio::test]
async fn insert_during_write_only_sees_new_column_default() {
    init_test_logging();
    let cluster = TestCluster::start(2).await.expect("cluster");
    cluster.create_table("test", enum_table()).await.expect("create");

    let session = cluster.session(1, "test");
    session
        .insert("t", &[("c1", "a".into()), ("c4", Datum::Int(1))])
        .await
        .expect("seed row");

    // 1. While c5 is write-only, insert a row that does not mention it.
    let inserted = at_state(&cluster, SchemaState::WriteOnly, session.clone(), |s| async move {
        let s = &s;
        retry_statement(|| async move { s.insert("t", &[("c1", "x".into()), ("c4", Datum::Int(9))]).await })
            .await
            .map(|_| ())
    });

    // 2. Add c5 int not null default 1.
    let job = cluster
        .alter(
            0,
            "test",
            "t",
            JobArgs::AddColumn {
                column: ColumnDef::new("c5", FieldType::Int).not_null().default_value(1_i64),
                position: ColumnPosition::Default,
            },
        )
        .await
        .expect("add column");
    assert_job_done(&job);
    inserted.await.expect("hook fired").expect("insert during write-only");

    // 3. Both rows read c5 = 1.
    cluster.reload_all().await.expect("reload");
    let rows = session.select("t", &["c4", "c5"]).await.expect("select");
    let values: Vec<_> = rows.into_iter().map(|r| r.values).collect();
    assert!(values.contains(&vec![Datum::Int(9), Datum::Int(1)]), "{values:?}");
    assert!(values.contains(&vec![Datum::Int(1), Datum::Int(1)]), "{values:?}");

    assert_monotonic_path(job.job_type, &cluster.hook().transitions(job.id));
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn writes_during_add_index_leave_index_consistent() {
    init_test_logging();
    let cluster = TestCluster::start(3).await.expect("cluster");
    cluster.create_table("test", abc_table("t")).await.expect("create");
    let session = cluster.session(2, "test");
    fill_abc(&session, "t", 0..100).await.expect("fill");

    // Writes while write-only maintain the index themselves; rows deleted
    // before the backfill snapshot must not come back as entries.
    let wrote = at_state(&cluster, SchemaState::WriteOnly, session.clone(), |s| async move {
        let s = &s;
        fill_abc(s, "t", 100..120).await?;
        retry_statement(|| async move { s.update("t", 5, &[("b", Datum::Int(-5))]).await }).await?;
        Ok(())
    });
    let deleted = at_state(&cluster, SchemaState::WriteReorganization, session.clone(), |s| async move {
        let s = &s;
        for handle in [1, 50, 110] {
            retry_statement(|| async move { s.delete("t", handle).await }).await?;
        }
        Ok(())
    });

    let job = cluster
        .alter(
            0,
            "test",
            "t",
            JobArgs::AddIndex {
                index: IndexDef::new("idx_b", ["b"]),
            },
        )
        .await
        .expect("add index");
    assert_job_done(&job);
    wrote.await.expect("hook fired").expect("writes during write-only");
    deleted.await.expect("hook fired").expect("deletes during reorganization");

    let table = cluster
        .node(0)
        .info_schema()
        .expect("schema")
        .table_by_name("test", "t")
        .expect("table");
    assert_eq!(table.find_index("idx_b").map(|i| i.state), Some(SchemaState::Public));
    assert_index_consistent(&cluster.store(), &table, "idx_b").await;

    let transitions = cluster.hook().transitions(job.id);
    assert_monotonic_path(job.job_type, &transitions);
    assert_eq!(
        cluster.hook().schema_states(job.id),
        vec![
            SchemaState::DeleteOnly,
            SchemaState::WriteOnly,
            SchemaState::WriteReorganization,
            SchemaState::Public,
        ]
    );
    assert_versions_increase(&cluster.hook().versions(job.id));
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn deletes_during_drop_index_leave_no_orphans() {
    init_test_logging();
    let cluster = TestCluster::start(2).await.expect("cluster");
    cluster
        .create_table("test", abc_table_indexed("t"))
        .await
        .expect("create");
    let session = cluster.session(1, "test");
    fill_abc(&session, "t", 0..40).await.expect("fill");

    let before = cluster
        .node(1)
        .info_schema()
        .expect("schema")
        .table_by_name("test", "t")
        .expect("table");
    let index = before.find_index("idx_c").expect("idx_c").id;

    let deleted = at_state(&cluster, SchemaState::WriteOnly, session.clone(), |s| async move {
        let s = &s;
        retry_statement(|| async move { s.delete("t", 3).await }).await?;
        Ok(())
    });
    let mixed = at_state(&cluster, SchemaState::DeleteOnly, session.clone(), |s| async move {
        let s = &s;
        retry_statement(|| async move { s.delete("t", 4).await }).await?;
        fill_abc(s, "t", 40..45).await
    });

    let job = cluster
        .alter(0, "test", "t", JobArgs::DropIndex { name: "idx_c".into() })
        .await
        .expect("drop index");
    assert_job_done(&job);
    deleted.await.expect("hook fired").expect("delete during write-only");
    mixed.await.expect("hook fired").expect("writes during delete-only");

    assert_no_keys(&cluster.store(), &codec::index_prefix(before.id, index)).await;
    assert_monotonic_path(job.job_type, &cluster.hook().transitions(job.id));

    cluster.reload_all().await.expect("reload");
    let rows = session.select("t", &["a"]).await.expect("select");
    assert_eq!(rows.len(), 43);
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn dropped_table_data_is_collected() {
    init_test_logging();
    let cluster = TestCluster::start(2).await.expect("cluster");
    cluster
        .create_table("test", abc_table_indexed("t"))
        .await
        .expect("create");
    fill_abc(&cluster.session(0, "test"), "t", 0..20).await.expect("fill");
    let table_id = cluster
        .node(0)
        .info_schema()
        .expect("schema")
        .table_by_name("test", "t")
        .expect("table")
        .id;

    let job = cluster
        .alter(1, "test", "t", JobArgs::DropTable)
        .await
        .expect("drop table");
    assert_job_done(&job);

    let err = cluster
        .session(1, "test")
        .select("t", &["a"])
        .await
        .expect_err("table is gone");
    assert!(err.to_string().contains("doesn't exist"), "{err}");

    // The owner purges the range on its next collection pass.
    let prefix = codec::table_prefix(table_id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = keel_core::kv::Snapshot::latest(cluster.store()).await.expect("snapshot");
        let left = snapshot
            .scan(&keel_core::kv::KeyRange::prefix(&prefix), 1)
            .await
            .expect("scan");
        if left.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "dropped rows were never purged");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn rename_is_visible_on_every_node() -> Result<()> {
    let cluster = TestCluster::start(3).await?;
    cluster.create_table("test", abc_table("t")).await?;
    let job = cluster
        .alter(
            0,
            "test",
            "t",
            JobArgs::RenameTable {
                new_name: "t2".into(),
            },
        )
        .await?;
    assert_eq!(cluster.hook().schema_states(job.id), vec![SchemaState::Public]);

    for node in cluster.nodes() {
        let schema = node.public_schema()?;
        assert!(schema.table("test", "t2").is_some());
        assert!(schema.table("test", "t").is_none());
    }
    cluster.shutdown().await
}
