//! Engine wiring and event capture for tests.

use crate::fakes::{MemoryArtifactStore, ScriptedRuntime};
use conveyor_core::events::Event;
use conveyor_core::ports::{EventBus, QualityGate};
use conveyor_scheduler::{BackoffPolicy, Engine, EngineConfig};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// An engine wired to in-memory doubles, with workspaces in a temp dir.
pub struct TestEngine {
    pub engine: Engine,
    pub runtime: Arc<ScriptedRuntime>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub workspace: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder::default()
    }

    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.engine.event_bus()
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct TestEngineBuilder {
    max_parallel_jobs: Option<usize>,
    backoff: Option<BackoffPolicy>,
    quality_gate: Option<Arc<dyn QualityGate>>,
    artifacts: Option<Arc<MemoryArtifactStore>>,
}

impl TestEngineBuilder {
    pub fn max_parallel_jobs(mut self, max: usize) -> Self {
        self.max_parallel_jobs = Some(max);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn quality_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.quality_gate = Some(gate);
        self
    }

    pub fn artifacts(mut self, store: Arc<MemoryArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn build(self) -> TestEngine {
        let workspace = tempfile::tempdir().expect("temp workspace");
        let runtime = ScriptedRuntime::new();
        let artifacts = self.artifacts.unwrap_or_else(MemoryArtifactStore::new);

        let config = EngineConfig::default()
            .with_workspace_root(workspace.path())
            .with_max_parallel_jobs(self.max_parallel_jobs.unwrap_or(4))
            .with_backoff(self.backoff.unwrap_or(BackoffPolicy::None));
        let mut builder = Engine::builder()
            .config(config)
            .runtime(runtime.clone())
            .artifact_store(artifacts.clone());
        if let Some(gate) = self.quality_gate {
            builder = builder.quality_gate(gate);
        }

        TestEngine {
            engine: builder.build().expect("engine builds"),
            runtime,
            artifacts,
            workspace,
        }
    }
}

/// Events captured from a bus subscription.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    /// Subscribe to `pattern` and record events in the background.
    pub async fn capture(bus: &Arc<dyn EventBus>, pattern: &str) -> Self {
        let log = Self::default();
        let mut stream = bus.subscribe(pattern).await.expect("subscribe");
        let events = log.events.clone();
        tokio::spawn(async move {
            while let Some(Ok(event)) = stream.next().await {
                events.lock().unwrap().push(event);
            }
        });
        log
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.events().iter().map(Event::subject).collect()
    }

    /// Wait until `condition` holds for the captured events.
    pub async fn wait_until(&self, mut condition: impl FnMut(&[Event]) -> bool) -> Vec<Event> {
        let wait = async {
            loop {
                let events = self.events();
                if condition(&events) {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("events arrived in time")
    }
}
