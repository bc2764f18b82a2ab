//! The pipeline engine.

use crate::approval::ApprovalRegistry;
use crate::bus::InMemoryEventBus;
use crate::config::EngineConfig;
use crate::environments::{EnvironmentLocks, TokenHolder};
use crate::plan::{RunPlan, plan_run};
use crate::run::{RunHandle, spawn_run};
use conveyor_core::approval::ApprovalGate;
use conveyor_core::context::CommitContext;
use conveyor_core::ids::ApprovalToken;
use conveyor_core::pipeline::PipelineDefinition;
use conveyor_core::ports::{ArtifactStore, EventBus, JobRuntime, QualityGate};
use conveyor_core::run::PipelineResult;
use conveyor_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

/// Collaborators shared by every run and job task of an engine.
pub(crate) struct Services {
    pub config: Arc<EngineConfig>,
    pub runtime: Arc<dyn JobRuntime>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub quality_gate: Option<Arc<dyn QualityGate>>,
    pub event_bus: Arc<dyn EventBus>,
    pub approvals: Arc<ApprovalRegistry>,
    pub locks: Arc<EnvironmentLocks>,
    /// Global limit on executing jobs.
    pub permits: Arc<Semaphore>,
}

/// Runs pipelines.
///
/// Cloning is cheap; clones share the executor limit, the approval
/// registry and the environment tokens.
#[derive(Clone)]
pub struct Engine {
    services: Arc<Services>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        self.services.event_bus.clone()
    }

    /// Validate a definition and decide what a run for `context` would do.
    pub fn plan(&self, definition: &PipelineDefinition, context: &CommitContext) -> Result<RunPlan> {
        plan_run(definition, context, &self.services.config)
    }

    /// Start a run in the background.
    pub fn start(&self, definition: &PipelineDefinition, context: &CommitContext) -> Result<RunHandle> {
        let plan = self.plan(definition, context)?;
        info!(
            run_id = %plan.run_id,
            pipeline = %plan.pipeline,
            ref_name = %context.ref_name(),
            "Scheduling run"
        );
        Ok(spawn_run(plan, self.services.clone()))
    }

    /// Run a pipeline to completion.
    pub async fn schedule(
        &self,
        definition: &PipelineDefinition,
        context: &CommitContext,
    ) -> Result<PipelineResult> {
        self.start(definition, context)?.result().await
    }

    pub async fn approve(
        &self,
        token: ApprovalToken,
        user: &str,
        comment: Option<String>,
    ) -> Result<ApprovalGate> {
        self.services.approvals.approve(token, user, comment).await
    }

    pub async fn reject(
        &self,
        token: ApprovalToken,
        user: &str,
        comment: Option<String>,
    ) -> Result<ApprovalGate> {
        self.services.approvals.reject(token, user, comment).await
    }

    /// Gates waiting for a decision across all runs.
    pub fn pending_approvals(&self) -> Vec<ApprovalGate> {
        self.services.approvals.pending()
    }

    /// Current holder of an environment token.
    pub fn environment_holder(&self, key: &str) -> Option<TokenHolder> {
        self.services.locks.holder(key)
    }

    /// Jobs queued for an environment token.
    pub fn environment_waiting(&self, key: &str) -> usize {
        self.services.locks.waiting(key)
    }
}

#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    runtime: Option<Arc<dyn JobRuntime>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    quality_gate: Option<Arc<dyn QualityGate>>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn JobRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn quality_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.quality_gate = Some(gate);
        self
    }

    /// Defaults to an [`InMemoryEventBus`].
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let runtime = self
            .runtime
            .ok_or_else(|| Error::Internal("engine has no job runtime".into()))?;
        let artifacts = self
            .artifacts
            .ok_or_else(|| Error::Internal("engine has no artifact store".into()))?;
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(InMemoryEventBus::new()));

        info!(
            runtime = runtime.name(),
            max_parallel_jobs = self.config.max_parallel_jobs,
            "Engine ready"
        );
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_jobs.max(1)));
        Ok(Engine {
            services: Arc::new(Services {
                config: Arc::new(self.config),
                runtime,
                artifacts,
                quality_gate: self.quality_gate,
                approvals: Arc::new(ApprovalRegistry::new(event_bus.clone())),
                event_bus,
                locks: Arc::new(EnvironmentLocks::new()),
                permits,
            }),
        })
    }
}
