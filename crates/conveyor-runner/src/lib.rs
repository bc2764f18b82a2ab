//! Job runtimes for Conveyor.
//!
//! Implementations of [`conveyor_core::ports::JobRuntime`]: the host shell,
//! Docker containers, and a router that picks between them per job. Also
//! hosts the HTTP quality gate client.

pub mod config;
pub mod container;
pub mod output;
pub mod quality;
pub mod router;
pub mod shell;

pub use config::{RunnerConfig, RuntimeKind};
pub use container::DockerRuntime;
pub use output::{LogSink, OutputLine, OutputStream};
pub use quality::{HttpQualityGate, QualityGateConfig};
pub use router::{RuntimeRouter, build_runtime};
pub use shell::ShellRuntime;
