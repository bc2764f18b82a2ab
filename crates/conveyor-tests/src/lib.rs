//! Integration test infrastructure for Conveyor.
//!
//! Provides in-memory doubles for every engine port plus the fixture
//! pipeline used across the integration tests.
//!
//! # Usage
//!
//! ```ignore
//! use conveyor_tests::{TestEngine, fixtures};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let t = TestEngine::new();
//!     let handle = t.engine.start(&fixtures::webapp(), &fixtures::branch("main")).unwrap();
//!     let run = handle.wait().await.unwrap();
//! }
//! ```

pub mod fakes;
pub mod fixtures;
pub mod helpers;

pub use fakes::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,conveyor_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
