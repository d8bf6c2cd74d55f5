//! Custom assertion helpers for scenario tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use keel_core::kv::{KeyRange, Snapshot, TxnStore};
use keel_ddl::model::{Job, JobState, JobType, SchemaState, TableInfo, ADD_PATH, DROP_PATH};
use keel_ddl::table::codec::{self, RowValue};
use keel_ddl::table::index_entry;

/// Asserts that a job finished successfully.
///
/// # Panics
///
/// Panics if the job is not `Done` or recorded an error that made it roll
/// back.
pub fn assert_job_done(job: &Job) {
    assert_eq!(
        job.state,
        JobState::Done,
        "Expected job {} to finish, but state was {} (error: {:?})",
        job.id,
        job.state,
        job.error
    );
}

/// Asserts that a job was cancelled and its error mentions `needle`.
///
/// # Panics
///
/// Panics if the job is not `Cancelled` or the error text does not match.
pub fn assert_job_cancelled(job: &Job, needle: &str) {
    assert_eq!(
        job.state,
        JobState::Cancelled,
        "Expected job {} to be cancelled, but state was {}",
        job.id,
        job.state
    );
    let error = job.error.as_deref().unwrap_or_default();
    assert!(
        error.contains(needle),
        "Expected job {} error to mention {needle:?}, got {error:?}",
        job.id
    );
}

fn path_for(job_type: JobType) -> &'static [SchemaState] {
    if job_type.is_drop() {
        &DROP_PATH
    } else {
        &ADD_PATH
    }
}

/// Asserts that the schema states a job committed walk its path one way
/// while running and never move forward again once rolling back.
///
/// `transitions` are the (lifecycle, schema) pairs in commit order, as
/// recorded by [`RecordingHook::transitions`](crate::hooks::RecordingHook::transitions).
///
/// # Panics
///
/// Panics on a state outside the path or a step in the wrong direction.
pub fn assert_monotonic_path(job_type: JobType, transitions: &[(JobState, SchemaState)]) {
    let path = path_for(job_type);
    let position = |state: SchemaState| {
        path.iter()
            .position(|s| *s == state)
            .unwrap_or_else(|| panic!("{state} is not on the {job_type} path"))
    };

    let mut last: Option<usize> = None;
    let mut rolling_back = false;
    for (state, schema_state) in transitions {
        let pos = position(*schema_state);
        let undoing = matches!(state, JobState::RollingBack | JobState::RollbackDone | JobState::Cancelled);
        if let Some(prev) = last {
            if undoing {
                assert!(
                    pos <= prev,
                    "{job_type} moved forward to {schema_state} while rolling back: {transitions:?}"
                );
            } else {
                assert!(
                    !rolling_back,
                    "{job_type} resumed forward progress after rolling back: {transitions:?}"
                );
                assert!(
                    pos >= prev,
                    "{job_type} moved backward to {schema_state}: {transitions:?}"
                );
            }
        }
        rolling_back |= undoing;
        last = Some(pos);
    }
}

/// Asserts that consecutive versions a job published strictly increase.
///
/// # Panics
///
/// Panics if a version repeats or decreases.
pub fn assert_versions_increase(versions: &[u64]) {
    for pair in versions.windows(2) {
        assert!(pair[0] < pair[1], "Versions do not increase: {versions:?}");
    }
}

/// Asserts that index `name` of `table` holds exactly the entries its rows
/// produce: none missing, none orphaned.
///
/// # Panics
///
/// Panics if the index is unknown, a read fails or the entry sets differ.
pub async fn assert_index_consistent(store: &Arc<dyn TxnStore>, table: &TableInfo, name: &str) {
    let index = table
        .find_index(name)
        .unwrap_or_else(|| panic!("table {} has no index {name}", table.name));
    let snapshot = Snapshot::latest(Arc::clone(store)).await.expect("snapshot");

    let mut expected = BTreeSet::new();
    for (key, raw) in snapshot
        .scan_all(&codec::record_range(table.id))
        .await
        .expect("scan rows")
    {
        let handle = codec::decode_record_handle(&key).expect("record handle");
        let row = RowValue::decode(&raw).expect("row value");
        let entry = index_entry(table, index, &row.cells, handle).expect("index entry");
        expected.insert((entry.key, entry.value));
    }

    let actual: BTreeSet<(Bytes, Bytes)> = snapshot
        .scan_all(&KeyRange::prefix(&codec::index_prefix(table.id, index.id)))
        .await
        .expect("scan index")
        .into_iter()
        .collect();

    let missing: Vec<_> = expected.difference(&actual).collect();
    let orphaned: Vec<_> = actual.difference(&expected).collect();
    assert!(
        missing.is_empty() && orphaned.is_empty(),
        "Index {name} of {} inconsistent: {} missing, {} orphaned",
        table.name,
        missing.len(),
        orphaned.len()
    );
}

/// Asserts that nothing remains under `prefix`.
///
/// # Panics
///
/// Panics if a key is found or the scan fails.
pub async fn assert_no_keys(store: &Arc<dyn TxnStore>, prefix: &[u8]) {
    let snapshot = Snapshot::latest(Arc::clone(store)).await.expect("snapshot");
    let left = snapshot
        .scan(&KeyRange::prefix(prefix), 4)
        .await
        .expect("scan");
    assert!(
        left.is_empty(),
        "Expected no keys under {}, found {}",
        keel_core::kv::display_key(prefix),
        left.len()
    );
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn forward_then_back_is_monotonic() {
        assert_monotonic_path(
            JobType::AddIndex,
            &[
                (JobState::Running, SchemaState::DeleteOnly),
                (JobState::Running, SchemaState::WriteOnly),
                (JobState::RollingBack, SchemaState::WriteOnly),
                (JobState::RollingBack, SchemaState::DeleteOnly),
                (JobState::RollbackDone, SchemaState::None),
                (JobState::Cancelled, SchemaState::None),
            ],
        );
    }

    #[test]
    #[should_panic(expected = "moved backward")]
    fn backward_step_while_running_panics() {
        assert_monotonic_path(
            JobType::DropColumn,
            &[
                (JobState::Running, SchemaState::WriteOnly),
                (JobState::Running, SchemaState::Public),
            ],
        );
    }

    proptest! {
        #[test]
        fn any_rollback_from_a_running_prefix_is_monotonic(reached in 1usize..4) {
            let mut transitions: Vec<_> = ADD_PATH[1..=reached]
                .iter()
                .map(|s| (JobState::Running, *s))
                .collect();
            transitions.extend(
                ADD_PATH[..reached]
                    .iter()
                    .rev()
                    .map(|s| (JobState::RollingBack, *s)),
            );
            assert_monotonic_path(JobType::AddIndex, &transitions);
        }
    }
}
