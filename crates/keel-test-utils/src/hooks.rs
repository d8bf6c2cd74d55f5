//! Hooks that record job execution and run test code at chosen points.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use keel_core::id::JobId;
use keel_ddl::error::Result;
use keel_ddl::hooks::DdlHook;
use keel_ddl::model::{Job, JobState, SchemaState};

/// One observed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    /// A queued job was picked up.
    Dequeued {
        /// The job.
        job_id: JobId,
    },
    /// A step committed.
    StateCommitted {
        /// The job.
        job_id: JobId,
        /// Lifecycle state after the step.
        state: JobState,
        /// Schema state after the step.
        schema_state: SchemaState,
        /// Version published by the step.
        version: u64,
    },
    /// A backfill chunk committed.
    BackfillChunk {
        /// The job.
        job_id: JobId,
        /// Range index.
        range: usize,
        /// Rows in the chunk.
        rows: usize,
    },
    /// The job was archived.
    Finished {
        /// The job.
        job_id: JobId,
        /// Terminal state.
        state: JobState,
    },
}

type Callback = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Trigger {
    schema_state: SchemaState,
    callback: Callback,
    fired: bool,
}

/// A [`DdlHook`] that records every event and runs registered callbacks.
///
/// Callbacks fire once each. State triggers run after the step reaching the
/// state committed and before the runner moves on, so the callback observes
/// the cluster at exactly that state.
#[derive(Default)]
pub struct RecordingHook {
    events: Mutex<Vec<HookEvent>>,
    triggers: Mutex<Vec<Trigger>>,
    chunk_trigger: Mutex<Option<Callback>>,
}

impl std::fmt::Debug for RecordingHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingHook")
            .field("events", &self.events.lock().map(|e| e.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl RecordingHook {
    /// Creates an empty hook.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs `f` once, the first time any job commits a step into `state`.
    pub fn on_schema_state<F, Fut>(&self, state: SchemaState, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.triggers.lock().expect("lock poisoned").push(Trigger {
            schema_state: state,
            callback: Arc::new(move |job| f(job).boxed()),
            fired: false,
        });
    }

    /// Runs `f` once, after the first backfill chunk of any job commits.
    pub fn on_first_backfill_chunk<F, Fut>(&self, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        *self.chunk_trigger.lock().expect("lock poisoned") = Some(Arc::new(move |job| f(job).boxed()));
    }

    /// All events so far.
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    /// The (lifecycle, schema) states `job` committed, in order.
    pub fn transitions(&self, job: JobId) -> Vec<(JobState, SchemaState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HookEvent::StateCommitted {
                    job_id,
                    state,
                    schema_state,
                    ..
                } if job_id == job => Some((state, schema_state)),
                _ => None,
            })
            .collect()
    }

    /// The schema states `job` committed, in order.
    pub fn schema_states(&self, job: JobId) -> Vec<SchemaState> {
        self.transitions(job).into_iter().map(|(_, s)| s).collect()
    }

    /// The versions `job` published, in order.
    pub fn versions(&self, job: JobId) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HookEvent::StateCommitted { job_id, version, .. } if job_id == job => Some(version),
                _ => None,
            })
            .collect()
    }

    /// Rows backfilled for `job`, summed over chunks.
    pub fn backfilled_rows(&self, job: JobId) -> usize {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HookEvent::BackfillChunk { job_id, rows, .. } if job_id == job => Some(rows),
                _ => None,
            })
            .sum()
    }

    fn record(&self, event: HookEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }

    fn take_trigger(&self, state: SchemaState) -> Option<Callback> {
        let mut triggers = self.triggers.lock().expect("lock poisoned");
        let trigger = triggers
            .iter_mut()
            .find(|t| !t.fired && t.schema_state == state)?;
        trigger.fired = true;
        Some(Arc::clone(&trigger.callback))
    }
}

#[async_trait]
impl DdlHook for RecordingHook {
    async fn before_dequeue(&self, job: &Job) -> Result<()> {
        self.record(HookEvent::Dequeued { job_id: job.id });
        Ok(())
    }

    async fn after_state_commit(&self, job: &Job) -> Result<()> {
        self.record(HookEvent::StateCommitted {
            job_id: job.id,
            state: job.state,
            schema_state: job.schema_state,
            version: job.schema_version,
        });
        match self.take_trigger(job.schema_state) {
            Some(callback) => callback(job.clone()).await,
            None => Ok(()),
        }
    }

    async fn after_backfill_chunk(&self, job: &Job, range: usize, rows: usize) -> Result<()> {
        self.record(HookEvent::BackfillChunk {
            job_id: job.id,
            range,
            rows,
        });
        let callback = self.chunk_trigger.lock().expect("lock poisoned").take();
        match callback {
            Some(callback) => callback(job.clone()).await,
            None => Ok(()),
        }
    }

    async fn on_job_finished(&self, job: &Job) {
        self.record(HookEvent::Finished {
            job_id: job.id,
            state: job.state,
        });
    }
}
