//! A serving node: schema snapshots, the lease that bounds their age, DDL
//! submission and the foreground statement path.
//!
//! A node loads the latest schema version, records it in its lease and keeps
//! refreshing both on an interval shorter than the lease TTL. Once its local
//! lease lapses the node refuses statements with a retryable error until it
//! has reloaded. Every node also runs a [`DdlOwner`] that competes for the
//! cluster-wide owner lease.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use keel_core::id::{JobId, NodeId, TableId};
use keel_core::kv::{Transaction, TxnStore};
use keel_core::observability::node_span;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::config::DdlConfig;
use crate::error::{Error, Result};
use crate::hooks::DdlHook;
use crate::keys;
use crate::lease::SchemaSyncer;
use crate::metrics::DdlMetrics;
use crate::model::{DatabaseInfo, Datum, Job, JobArgs, JobRequest, JobState, TableDef};
use crate::owner::{OwnerElector, OwnerLease};
use crate::queue::JobQueue;
use crate::scheduler::DdlOwner;
use crate::schema::{InfoSchema, Meta, PublicSchema, SchemaLoader};
use crate::table::{Row, Table};

/// How long [`Node::execute`] waits for a job.
pub const DDL_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Loaded {
    schema: Arc<InfoSchema>,
    valid_until: Instant,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("node schema lock poisoned")
}

/// One serving node.
pub struct Node {
    id: NodeId,
    store: Arc<dyn TxnStore>,
    config: DdlConfig,
    loader: SchemaLoader,
    syncer: SchemaSyncer,
    queue: JobQueue,
    loaded: RwLock<Loaded>,
    reload_lock: tokio::sync::Mutex<()>,
    owner_lease: OwnerLease,
    owner_wakeup: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: DdlMetrics,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Starts a node: loads the latest schema, publishes its lease and spawns
    /// the refresher and owner loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the initial load
    /// fails.
    pub async fn start(
        store: Arc<dyn TxnStore>,
        elector: Arc<dyn OwnerElector>,
        config: DdlConfig,
        hook: Arc<dyn DdlHook>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let id = NodeId::generate();
        let loader = SchemaLoader::new(Arc::clone(&store));
        let syncer = SchemaSyncer::new(Arc::clone(&store), config.lease.clone());

        let started = Instant::now();
        let version = loader.latest_version().await?;
        let schema = Arc::new(loader.load(version).await?);
        syncer.publish_lease(id, version).await?;

        let owner = DdlOwner::new(id, Arc::clone(&store), elector, &config, hook);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let node = Arc::new(Self {
            id,
            queue: JobQueue::new(Arc::clone(&store), config.retry.clone()),
            loaded: RwLock::new(Loaded {
                schema,
                valid_until: started + config.lease.ttl(),
            }),
            reload_lock: tokio::sync::Mutex::new(()),
            owner_lease: owner.lease(),
            owner_wakeup: owner.wakeup(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            metrics: DdlMetrics::new(),
            store,
            config,
            loader,
            syncer,
        });

        let refresher = node.spawn_refresher(shutdown_rx.clone());
        let owner = owner.spawn(shutdown_rx);
        node.tasks.lock().map_err(poison_err)?.extend([refresher, owner]);
        info!(node = %id, version, "node started");
        Ok(node)
    }

    /// This node's ID.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The store this node serves from.
    #[must_use]
    pub fn store(&self) -> Arc<dyn TxnStore> {
        Arc::clone(&self.store)
    }

    /// Returns true while this node holds the DDL owner lease.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner_lease.is_valid()
    }

    fn spawn_refresher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let span = node_span("schema_refresh", node.id);
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(node.config.lease.refresh_interval());
                interval.tick().await;
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = interval.tick() => {
                            if let Err(err) = node.reload().await {
                                warn!(error = %err, "schema refresh failed");
                            }
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Loads the latest schema version and renews the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the load or the lease write fails; the previous
    /// snapshot stays in place until its lease lapses.
    pub async fn reload(&self) -> Result<u64> {
        let _guard = self.reload_lock.lock().await;
        let started = Instant::now();
        let current = Arc::clone(&self.loaded.read().map_err(poison_err)?.schema);
        let latest = self.loader.latest_version().await?;
        let schema = if latest == current.version() {
            current
        } else {
            Arc::new(self.loader.advance(&current, latest).await?)
        };
        self.syncer.publish_lease(self.id, latest).await?;

        let previous = {
            let mut loaded = self.loaded.write().map_err(poison_err)?;
            let previous = loaded.schema.version();
            *loaded = Loaded {
                schema,
                valid_until: started + self.config.lease.ttl(),
            };
            previous
        };
        if previous != latest {
            debug!(from = previous, to = latest, "schema reloaded");
            self.metrics.set_schema_version(latest);
        }
        Ok(latest)
    }

    /// The schema snapshot statements run against.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaLeaseExpired`] once the node's lease lapsed.
    pub fn info_schema(&self) -> Result<Arc<InfoSchema>> {
        let loaded = self.loaded.read().map_err(poison_err)?;
        if Instant::now() >= loaded.valid_until {
            return Err(Error::SchemaLeaseExpired {
                version: loaded.schema.version(),
            });
        }
        Ok(Arc::clone(&loaded.schema))
    }

    /// The public part of the current snapshot, as the planner sees it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaLeaseExpired`] once the node's lease lapsed.
    pub fn public_schema(&self) -> Result<PublicSchema> {
        Ok(self.info_schema()?.public_view())
    }

    fn ensure_lease(&self) -> Result<()> {
        self.info_schema().map(|_| ())
    }

    /// Creates a database directly (not through the job queue).
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the write fails.
    pub async fn create_database(&self, name: &str) -> Result<DatabaseInfo> {
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let db = Meta::new(&mut txn).create_database(name).await?;
        txn.commit().await?;
        self.reload().await?;
        Ok(db)
    }

    /// Builds a request against `db.table`, planned at the current version.
    ///
    /// # Errors
    ///
    /// Returns an error if the names do not resolve.
    pub fn request(&self, db: &str, table: &str, args: JobArgs) -> Result<JobRequest> {
        let schema = self.info_schema()?;
        let info = schema.table_by_name(db, table)?;
        Ok(JobRequest::new(info.schema_id, info.id, args).planned_at(schema.version()))
    }

    /// Builds an `IF EXISTS` request against `db.table`. A table that does
    /// not resolve is left for submission to report as a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseNotExists`] if `db` is unknown.
    pub fn request_if_exists(&self, db: &str, table: &str, args: JobArgs) -> Result<JobRequest> {
        let schema = self.info_schema()?;
        let request = match schema.table_by_name(db, table) {
            Ok(info) => JobRequest::new(info.schema_id, info.id, args),
            Err(Error::TableNotExists { .. }) => {
                let database = schema
                    .database_by_name(db)
                    .ok_or_else(|| Error::DatabaseNotExists {
                        name: db.to_string(),
                    })?;
                JobRequest::unresolved(database.id, table, args)
            }
            Err(err) => return Err(err),
        };
        Ok(request.planned_at(schema.version()).if_exists())
    }

    /// Builds a `DROP DATABASE` request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseNotExists`] if `db` is unknown.
    pub fn drop_database_request(&self, db: &str) -> Result<JobRequest> {
        let schema = self.info_schema()?;
        let database = schema
            .database_by_name(db)
            .ok_or_else(|| Error::DatabaseNotExists {
                name: db.to_string(),
            })?;
        Ok(JobRequest::drop_database(database.id).planned_at(schema.version()))
    }

    /// Builds a `CREATE TABLE` request in `db`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseNotExists`] if `db` is unknown.
    pub fn create_table_request(&self, db: &str, def: TableDef) -> Result<JobRequest> {
        let schema = self.info_schema()?;
        let database = schema
            .database_by_name(db)
            .ok_or_else(|| Error::DatabaseNotExists {
                name: db.to_string(),
            })?;
        Ok(JobRequest::create_table(database.id, def).planned_at(schema.version()))
    }

    /// Durably enqueues a request and returns its job ID.
    ///
    /// # Errors
    ///
    /// Returns a validation or conflict error.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let id = self.queue.enqueue(request).await?;
        self.owner_wakeup.notify_one();
        Ok(id)
    }

    /// Waits until job `id` is archived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobFailed`] with the job's terminal error text if it
    /// was cancelled, [`Error::Timeout`] if it is still running after
    /// `timeout`.
    pub async fn wait_for_job(&self, id: JobId, timeout: Duration) -> Result<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self
                .queue
                .get(id)
                .await?
                .ok_or(Error::JobNotFound { job_id: id })?;
            if job.state.is_terminal() {
                if job.state != JobState::Done {
                    return Err(Error::JobFailed {
                        job_id: id,
                        message: job.error.unwrap_or_else(|| job.state.to_string()),
                    });
                }
                if let Err(err) = self.reload().await {
                    warn!(error = %err, "reload after job completion failed");
                }
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("DDL job {id}"),
                });
            }
            tokio::time::sleep(self.config.owner.poll_interval()).await;
        }
    }

    /// Submits a request and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns the submission error or the job's terminal error.
    pub async fn execute(&self, request: JobRequest) -> Result<Job> {
        let id = self.submit(request).await?;
        self.wait_for_job(id, DDL_WAIT_TIMEOUT).await
    }

    /// Requests cancellation of job `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] or [`Error::CannotCancel`].
    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        self.queue.request_cancel(id).await?;
        self.owner_wakeup.notify_one();
        Ok(())
    }

    /// Looks up a job, active or archived.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn job(&self, id: JobId) -> Result<Option<Job>> {
        self.queue.get(id).await
    }

    /// Archived jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn history(&self, limit: usize) -> Result<Vec<Job>> {
        self.queue.history(limit).await
    }

    /// Opens a session on `db`.
    #[must_use]
    pub fn session(self: &Arc<Self>, db: &str) -> Session {
        Session {
            node: Arc::clone(self),
            db: db.to_string(),
        }
    }

    /// Stops the background loops, resigns ownership and removes the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease removal fails.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().map_err(poison_err)?.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        self.syncer.remove_lease(self.id).await?;
        info!(node = %self.id, "node stopped");
        Ok(())
    }

    /// Stops the node abruptly, as if its process died: background loops are
    /// aborted, nothing is resigned and the lease record stays until it
    /// expires.
    pub fn kill(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.owner_lease.revoke();
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.valid_until = Instant::now();
        }
        warn!(node = %self.id, "node killed");
    }
}

/// A statement context on one node and database.
#[derive(Debug, Clone)]
pub struct Session {
    node: Arc<Node>,
    db: String,
}

impl Session {
    /// The node this session runs on.
    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    async fn prepare(&self, table: &str) -> Result<(Arc<InfoSchema>, Table, Transaction)> {
        let schema = self.node.info_schema()?;
        let info = schema.table_by_name(&self.db, table)?;
        let txn = Transaction::begin(self.node.store()).await?;
        Ok((schema, Table::new(info), txn))
    }

    /// Commits `txn` unless the schema moved too far since `schema` was
    /// loaded.
    async fn commit(&self, mut txn: Transaction, schema: &InfoSchema, table: TableId) -> Result<()> {
        let planned = schema.version();
        let start_ts = txn.start_ts();
        let latest = {
            let meta = Meta::new(&mut txn);
            let latest = meta.schema_version().await?;
            if latest > planned + 1 {
                return Err(Error::SchemaChanged);
            }
            if latest > planned
                && meta
                    .diffs_between(planned, latest)
                    .await?
                    .iter()
                    .any(|diff| diff.invalidates(table))
            {
                return Err(Error::SchemaChanged);
            }
            latest
        };
        self.node.ensure_lease()?;
        txn.assert_unchanged(keys::SCHEMA_VERSION, start_ts);

        match txn.commit().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = Error::from(err);
                if err.is_write_conflict() && self.node.loader.latest_version().await? != latest {
                    Err(Error::SchemaChanged)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Opens a write transaction on `table`, planned against the schema
    /// loaded now. Its writes stay invisible until
    /// [`TableTxn::commit`].
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not resolve or the node's schema
    /// lease has lapsed.
    pub async fn begin(&self, table: &str) -> Result<TableTxn> {
        let (schema, table, txn) = self.prepare(table).await?;
        Ok(TableTxn {
            session: self.clone(),
            schema,
            table,
            txn,
        })
    }

    /// `INSERT`; returns the new row's handle.
    ///
    /// # Errors
    ///
    /// Returns a validation, stale-schema or storage error.
    pub async fn insert(&self, table: &str, values: &[(&str, Datum)]) -> Result<i64> {
        let (schema, t, mut txn) = self.prepare(table).await?;
        let handle = t.insert(&mut txn, values).await?;
        self.commit(txn, &schema, t.info().id).await?;
        Ok(handle)
    }

    /// `UPDATE` of one row; returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a validation, stale-schema or storage error.
    pub async fn update(&self, table: &str, handle: i64, values: &[(&str, Datum)]) -> Result<bool> {
        let (schema, t, mut txn) = self.prepare(table).await?;
        let updated = t.update(&mut txn, handle, values).await?;
        self.commit(txn, &schema, t.info().id).await?;
        Ok(updated)
    }

    /// `DELETE` of one row; returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a stale-schema or storage error.
    pub async fn delete(&self, table: &str, handle: i64) -> Result<bool> {
        let (schema, t, mut txn) = self.prepare(table).await?;
        let deleted = t.delete(&mut txn, handle).await?;
        self.commit(txn, &schema, t.info().id).await?;
        Ok(deleted)
    }

    /// `SELECT` of the named public columns (all if empty) of every row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`], a stale-schema or storage error.
    pub async fn select(&self, table: &str, columns: &[&str]) -> Result<Vec<Row>> {
        let (schema, t, txn) = self.prepare(table).await?;
        let rows = t.scan(&txn, columns).await?;
        self.commit(txn, &schema, t.info().id).await?;
        Ok(rows)
    }

    /// Point lookup by handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`], a stale-schema or storage error.
    pub async fn get(&self, table: &str, handle: i64, columns: &[&str]) -> Result<Option<Row>> {
        let (schema, t, txn) = self.prepare(table).await?;
        let row = t.get(&txn, handle, columns).await?;
        self.commit(txn, &schema, t.info().id).await?;
        Ok(row)
    }
}

/// Several writes to one table that commit together.
#[derive(Debug)]
pub struct TableTxn {
    session: Session,
    schema: Arc<InfoSchema>,
    table: Table,
    txn: Transaction,
}

impl TableTxn {
    /// Schema version the transaction was planned against.
    #[must_use]
    pub fn planned_version(&self) -> u64 {
        self.schema.version()
    }

    /// `INSERT`; returns the new row's handle.
    ///
    /// # Errors
    ///
    /// Returns a validation or storage error.
    pub async fn insert(&mut self, values: &[(&str, Datum)]) -> Result<i64> {
        self.table.insert(&mut self.txn, values).await
    }

    /// `UPDATE` of one row; returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a validation or storage error.
    pub async fn update(&mut self, handle: i64, values: &[(&str, Datum)]) -> Result<bool> {
        self.table.update(&mut self.txn, handle, values).await
    }

    /// `DELETE` of one row; returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn delete(&mut self, handle: i64) -> Result<bool> {
        self.table.delete(&mut self.txn, handle).await
    }

    /// Commits every write, unless the schema moved too far since the
    /// transaction began.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaChanged`] if a newer version invalidated the
    /// plan, or a storage error.
    pub async fn commit(self) -> Result<()> {
        let id = self.table.info().id;
        self.session.commit(self.txn, &self.schema, id).await
    }
}
