//! Conveyor Core
//!
//! Domain types, rule evaluation, and port traits for the Conveyor pipeline
//! engine. This crate has no runtime dependencies and defines the shared
//! vocabulary used by the scheduler, runtimes, artifact store and notifier.

pub mod approval;
pub mod context;
pub mod environment;
pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod rules;
pub mod run;

pub use context::CommitContext;
pub use error::{Error, FailureClass, Result};
pub use ids::*;
