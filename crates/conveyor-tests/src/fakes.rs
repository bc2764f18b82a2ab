//! In-memory doubles for the engine's ports.

use async_trait::async_trait;
use conveyor_core::ids::{ArtifactHandle, RunId};
use conveyor_core::ports::{
    ArtifactStore, ArtifactUpload, ExecutionOutcome, ExecutionRequest, JobRuntime, Notification,
    NotificationChannel, QualityGate, QualityGateRequest, QualityVerdict,
};
use conveyor_core::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// What one attempt of a scripted job does.
#[derive(Debug, Clone)]
pub enum Step {
    Exit(i32),
    /// The runtime could not provision the job (a transient failure).
    ProvisionError,
    /// Never finishes on its own.
    Hang,
}

/// Entry of the runtime's execution log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Started { run_id: RunId, job: String, attempt: u32 },
    Finished { run_id: RunId, job: String, attempt: u32 },
}

impl Execution {
    pub fn job(&self) -> &str {
        match self {
            Execution::Started { job, .. } | Execution::Finished { job, .. } => job,
        }
    }
}

/// Job runtime whose attempts follow per-job scripts.
///
/// Jobs without a script exit 0. Held jobs block after starting until
/// [`ScriptedRuntime::release`] is called.
#[derive(Default)]
pub struct ScriptedRuntime {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    files: Mutex<HashMap<String, Vec<(String, String)>>>,
    holds: Mutex<HashMap<String, Arc<Semaphore>>>,
    log: Mutex<Vec<Execution>>,
    requests: Mutex<Vec<ExecutionRequest>>,
    seen: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue attempt outcomes for `job`; later attempts exit 0.
    pub fn script(&self, job: &str, steps: impl IntoIterator<Item = Step>) {
        self.steps
            .lock()
            .unwrap()
            .entry(job.to_string())
            .or_default()
            .extend(steps);
    }

    /// Every attempt of `job` fails with `step`.
    pub fn always(&self, job: &str, step: Step) {
        self.script(job, std::iter::repeat_n(step, 64));
    }

    /// Write `content` to `path` in the workspace when `job` runs.
    pub fn writes(&self, job: &str, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .entry(job.to_string())
            .or_default()
            .push((path.to_string(), content.to_string()));
    }

    /// Block `job` after it starts until released.
    pub fn hold(&self, job: &str) {
        self.holds
            .lock()
            .unwrap()
            .insert(job.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Let one held execution of `job` finish.
    pub fn release(&self, job: &str) {
        if let Some(gate) = self.holds.lock().unwrap().get(job) {
            gate.add_permits(1);
        }
    }

    pub fn log(&self) -> Vec<Execution> {
        self.log.lock().unwrap().clone()
    }

    pub fn attempts(&self, job: &str) -> usize {
        self.log()
            .iter()
            .filter(|e| matches!(e, Execution::Started { .. }) && e.job() == job)
            .count()
    }

    pub fn ran(&self, job: &str) -> bool {
        self.attempts(job) > 0
    }

    /// Requests received for `job`, in order.
    pub fn requests(&self, job: &str) -> Vec<ExecutionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.job == job)
            .cloned()
            .collect()
    }

    /// Workspace contents at the start of each attempt of `job`, keyed by relative path.
    pub fn workspace_at_start(&self, job: &str) -> Vec<HashMap<String, String>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(j, _)| j == job)
            .map(|(_, files)| files.clone())
            .collect()
    }

    fn next_step(&self, job: &str) -> Step {
        self.steps
            .lock()
            .unwrap()
            .get_mut(job)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Exit(0))
    }

    fn write_files(&self, job: &str, workspace: &Path) -> Result<()> {
        let files = self.files.lock().unwrap().get(job).cloned().unwrap_or_default();
        for (path, content) in files {
            let path = workspace.join(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        Ok(())
    }
}

fn snapshot(root: &Path) -> HashMap<String, String> {
    fn walk(root: &Path, dir: &Path, files: &mut HashMap<String, String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, files);
            } else if let (Ok(relative), Ok(content)) =
                (path.strip_prefix(root), std::fs::read_to_string(&path))
            {
                files.insert(relative.to_string_lossy().replace('\\', "/"), content);
            }
        }
    }

    let mut files = HashMap::new();
    walk(root, root, &mut files);
    files
}

#[async_trait]
impl JobRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        let files = snapshot(&request.workspace);
        self.seen.lock().unwrap().push((request.job.clone(), files));
        self.log.lock().unwrap().push(Execution::Started {
            run_id: request.run_id,
            job: request.job.clone(),
            attempt: request.attempt,
        });

        let hold = self.holds.lock().unwrap().get(&request.job).cloned();
        if let Some(gate) = hold
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }

        let step = self.next_step(&request.job);
        let result = match step {
            Step::Exit(code) => {
                if code == 0 {
                    self.write_files(&request.job, &request.workspace)?;
                }
                Ok(ExecutionOutcome {
                    exit_code: code,
                    duration: Duration::from_millis(1),
                    log: vec![format!("{} attempt {}", request.job, request.attempt)],
                })
            }
            Step::ProvisionError => Err(Error::RuntimeProvision("no runner available".into())),
            Step::Hang => std::future::pending().await,
        };

        self.log.lock().unwrap().push(Execution::Finished {
            run_id: request.run_id,
            job: request.job.clone(),
            attempt: request.attempt,
        });
        result
    }
}

struct StoredArtifact {
    files: Vec<(PathBuf, Vec<u8>)>,
}

/// Artifact store keeping archives in memory.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<ArtifactHandle, StoredArtifact>>,
    fail_puts: Mutex<bool>,
}

impl MemoryArtifactStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later `put` fail.
    pub fn fail_puts(&self) {
        *self.fail_puts.lock().unwrap() = true;
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn collect_files(root: &Path, path: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) -> Result<()> {
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            collect_files(root, &entry?.path(), out)?;
        }
    } else if path.is_file() {
        let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        out.push((relative, std::fs::read(path)?));
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, upload: &ArtifactUpload) -> Result<ArtifactHandle> {
        if *self.fail_puts.lock().unwrap() {
            return Err(Error::Artifact("store unavailable".into()));
        }
        let mut files = Vec::new();
        for path in &upload.paths {
            collect_files(&upload.workspace, &upload.workspace.join(path), &mut files)?;
        }
        if files.is_empty() {
            return Err(Error::Artifact(format!("no files matched for {}", upload.job)));
        }
        let handle = ArtifactHandle::new();
        self.artifacts
            .lock()
            .unwrap()
            .insert(handle, StoredArtifact { files });
        Ok(handle)
    }

    async fn get(&self, handle: ArtifactHandle, dest: &Path) -> Result<Vec<PathBuf>> {
        let artifacts = self.artifacts.lock().unwrap();
        let stored = artifacts
            .get(&handle)
            .ok_or_else(|| Error::ArtifactNotFound(handle.to_string()))?;
        let mut written = Vec::new();
        for (relative, content) in &stored.files {
            let path = dest.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, content)?;
            written.push(path);
        }
        Ok(written)
    }

    async fn exists(&self, handle: ArtifactHandle) -> Result<bool> {
        Ok(self.artifacts.lock().unwrap().contains_key(&handle))
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Channel that keeps every notification it receives.
pub struct RecordingChannel {
    name: String,
    received: Mutex<Vec<Notification>>,
}

impl RecordingChannel {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        self.received.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Channel whose deliveries always fail.
#[derive(Default)]
pub struct FailingChannel {
    attempts: AtomicUsize,
}

impl FailingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for FailingChannel {
    fn name(&self) -> &str {
        "failing"
    }

    async fn send(&self, _notification: &Notification) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::NotificationDelivery("endpoint returned 503".into()))
    }
}

/// Quality gate answering every submission with the same verdict.
pub struct StaticQualityGate {
    verdict: QualityVerdict,
    submissions: Mutex<Vec<QualityGateRequest>>,
}

impl StaticQualityGate {
    pub fn new(verdict: QualityVerdict) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn submissions(&self) -> Vec<QualityGateRequest> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl QualityGate for StaticQualityGate {
    async fn submit(&self, request: &QualityGateRequest) -> Result<QualityVerdict> {
        self.submissions.lock().unwrap().push(request.clone());
        Ok(self.verdict.clone())
    }
}
