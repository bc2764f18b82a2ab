//! Pipeline scheduling and orchestration for Conveyor.
//!
//! [`Engine`] plans a run from a definition and a commit context, then
//! drives the stage graph: approval gates, environment tokens, retries and
//! the executor concurrency limit all live here.

pub mod approval;
pub mod bus;
pub mod config;
pub mod dag;
pub mod engine;
pub mod environments;
mod job;
pub mod plan;
pub mod retry;
pub mod run;

pub use bus::InMemoryEventBus;
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use plan::{PlannedJob, RunPlan};
pub use retry::BackoffPolicy;
pub use run::RunHandle;
