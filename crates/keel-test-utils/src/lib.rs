//! Shared test utilities for keel scenario tests.
//!
//! This crate provides:
//! - [`TestCluster`]: several nodes over one store with short leases
//! - [`FaultyStore`]: a store wrapper that injects transient failures
//! - [`RecordingHook`]: records job execution and runs code at chosen states
//! - Table fixtures and a retrying statement helper
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_test_utils::{assert_job_done, TestCluster};
//!
//! #[tokio::test]
//! async fn test_example() -> keel_ddl::error::Result<()> {
//!     let cluster = TestCluster::start(3).await?;
//!     let job = cluster.create_table("app", users()).await?;
//!     assert_job_done(&job);
//!     cluster.shutdown().await
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod cluster;
pub mod fixtures;
pub mod hooks;
pub mod simulation;

pub use assertions::*;
pub use cluster::*;
pub use fixtures::*;
pub use hooks::*;
pub use simulation::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("keel=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
