//! Multi-node test clusters.
//!
//! A [`TestCluster`] runs several [`Node`]s in one process over a shared
//! store and owner elector, with leases short enough that convergence and
//! failover finish in well under a second.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::kv::{MemoryStore, TxnStore};
use keel_ddl::config::{DdlConfig, LeaseConfig, OwnerConfig, ReorgConfig, RetryConfig};
use keel_ddl::error::{Error, Result};
use keel_ddl::hooks::DdlHook;
use keel_ddl::model::{Job, JobArgs, TableDef};
use keel_ddl::node::{Node, Session};
use keel_ddl::owner::memory::MemoryOwnerElector;
use keel_ddl::owner::OwnerElector;

use crate::hooks::RecordingHook;

/// Configuration with short leases and small backfill chunks.
pub fn fast_config() -> DdlConfig {
    DdlConfig {
        lease: LeaseConfig {
            ttl_ms: 400,
            refresh_interval_ms: 50,
            convergence_poll_ms: 5,
        },
        owner: OwnerConfig {
            lease_ms: 300,
            poll_interval_ms: 10,
            max_concurrent_jobs: 8,
        },
        reorg: ReorgConfig {
            workers: 3,
            batch_size: 16,
        },
        retry: RetryConfig {
            max_attempts: 8,
            base_backoff_ms: 5,
            max_backoff_ms: 50,
        },
    }
}

/// Several nodes sharing one store.
pub struct TestCluster {
    store: Arc<dyn TxnStore>,
    elector: Arc<MemoryOwnerElector>,
    hook: Arc<RecordingHook>,
    config: DdlConfig,
    nodes: Vec<Arc<Node>>,
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCluster")
            .field("elector", &self.elector)
            .field("hook", &self.hook)
            .field("config", &self.config)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl TestCluster {
    /// Starts `size` nodes over a fresh in-memory store with [`fast_config`].
    ///
    /// # Errors
    ///
    /// Returns an error if a node fails to start.
    pub async fn start(size: usize) -> Result<Self> {
        Self::with_store(MemoryStore::shared(), size, fast_config()).await
    }

    /// Starts `size` nodes over `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if a node fails to start.
    pub async fn with_store(store: Arc<dyn TxnStore>, size: usize, config: DdlConfig) -> Result<Self> {
        let mut cluster = Self {
            elector: Arc::new(MemoryOwnerElector::new(config.owner.lease())),
            hook: RecordingHook::new(),
            nodes: Vec::with_capacity(size),
            store,
            config,
        };
        for _ in 0..size {
            cluster.add_node().await?;
        }
        Ok(cluster)
    }

    /// Starts one more node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to start.
    pub async fn add_node(&mut self) -> Result<Arc<Node>> {
        let node = Node::start(
            Arc::clone(&self.store),
            Arc::clone(&self.elector) as Arc<dyn OwnerElector>,
            self.config.clone(),
            Arc::clone(&self.hook) as Arc<dyn DdlHook>,
        )
        .await?;
        self.nodes.push(Arc::clone(&node));
        Ok(node)
    }

    /// The shared store.
    pub fn store(&self) -> Arc<dyn TxnStore> {
        Arc::clone(&self.store)
    }

    /// The hook every node's owner loop reports to.
    pub fn hook(&self) -> &Arc<RecordingHook> {
        &self.hook
    }

    /// The configuration nodes were started with.
    pub fn config(&self) -> &DdlConfig {
        &self.config
    }

    /// Node `n`, in start order.
    pub fn node(&self, n: usize) -> &Arc<Node> {
        &self.nodes[n]
    }

    /// All nodes, including killed ones.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Waits until some node holds the owner lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no node became owner in time.
    pub async fn owner(&self, timeout: Duration) -> Result<Arc<Node>> {
        self.owner_except(None, timeout).await
    }

    /// Waits until a node other than `old` holds the owner lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no other node took over in time.
    pub async fn new_owner(&self, old: &Arc<Node>, timeout: Duration) -> Result<Arc<Node>> {
        self.owner_except(Some(old), timeout).await
    }

    async fn owner_except(&self, old: Option<&Arc<Node>>, timeout: Duration) -> Result<Arc<Node>> {
        let deadline = Instant::now() + timeout;
        loop {
            let owner = self
                .nodes
                .iter()
                .find(|n| n.is_owner() && old.map_or(true, |o| o.id() != n.id()));
            if let Some(owner) = owner {
                return Ok(Arc::clone(owner));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: "DDL owner election".to_string(),
                });
            }
            tokio::time::sleep(self.config.owner.poll_interval()).await;
        }
    }

    /// Creates `db` and a table in it through node 0, waiting for the job.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub async fn create_table(&self, db: &str, def: TableDef) -> Result<Job> {
        let node = self.node(0);
        if node.info_schema()?.database_by_name(db).is_none() {
            node.create_database(db).await?;
        }
        node.execute(node.create_table_request(db, def)?).await
    }

    /// Runs `args` against `db.table` through node `n`, waiting for the job.
    ///
    /// # Errors
    ///
    /// Returns the submission error or the job's terminal error.
    pub async fn alter(&self, n: usize, db: &str, table: &str, args: JobArgs) -> Result<Job> {
        let node = self.node(n);
        node.execute(node.request(db, table, args)?).await
    }

    /// Opens a session on node `n`.
    pub fn session(&self, n: usize, db: &str) -> Session {
        self.node(n).session(db)
    }

    /// Brings every node up to the latest version.
    ///
    /// # Errors
    ///
    /// Returns the first reload failure of a live node.
    pub async fn reload_all(&self) -> Result<()> {
        for node in &self.nodes {
            if node.info_schema().is_ok() {
                node.reload().await?;
            }
        }
        Ok(())
    }

    /// Stops every node that is still running.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown failure.
    pub async fn shutdown(self) -> Result<()> {
        for node in &self.nodes {
            node.shutdown().await?;
        }
        Ok(())
    }
}
