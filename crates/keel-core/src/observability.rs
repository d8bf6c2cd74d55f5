//! Observability setup for keel.
//!
//! Structured logging with consistent spans. Every DDL log line carries the
//! job and table it concerns so one job can be followed across owner
//! failovers.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::id::{JobId, NodeId, TableId};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at process startup. Safe to call multiple times; subsequent calls
/// are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `keel_ddl=debug`)
///
/// # Example
///
/// ```rust
/// use keel_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for work done on behalf of one DDL job.
///
/// # Example
///
/// ```rust
/// use keel_core::id::{JobId, TableId};
/// use keel_core::observability::ddl_job_span;
///
/// let span = ddl_job_span("add_index", JobId::new(7), TableId::new(42));
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn ddl_job_span(job_type: &str, job_id: JobId, table_id: TableId) -> Span {
    tracing::info_span!(
        "ddl_job",
        job_type = job_type,
        job_id = job_id.get(),
        table_id = table_id.get(),
    )
}

/// Creates a span for a serving node's schema synchronization work.
#[must_use]
pub fn node_span(operation: &str, node_id: NodeId) -> Span {
    tracing::info_span!("node", op = operation, node_id = %node_id)
}
