//! Command handlers.

use crate::commands::ContextArgs;
use crate::config::CliSettings;
use crate::display;
use anyhow::{Context, Result, bail};
use console::style;
use conveyor_artifacts::FilesystemArtifactStore;
use conveyor_core::events::{ApprovalRequestedPayload, Event};
use conveyor_core::pipeline::PipelineDefinition;
use conveyor_core::ports::{ArtifactStore, EventBus};
use conveyor_core::run::RunStatus;
use conveyor_core::CommitContext;
use conveyor_notify::Notifier;
use conveyor_runner::{HttpQualityGate, QualityGateConfig, build_runtime};
use conveyor_scheduler::dag::StageGraph;
use conveyor_scheduler::{Engine, EngineConfig};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const TEMPLATE: &str = include_str!("template.yaml");

/// Write a starter pipeline.
pub fn init(path: &Path) -> Result<()> {
    if path.exists() {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }
    std::fs::write(path, TEMPLATE).with_context(|| format!("writing {}", path.display()))?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    PipelineDefinition::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Validate a pipeline definition, including its job graph.
pub fn validate(path: &Path) -> Result<()> {
    let definition = load_definition(path)?;
    let graph = StageGraph::build(&definition).map_err(conveyor_core::Error::from)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    for stage in graph.stages() {
        let jobs: Vec<_> = graph.jobs_in_stage(stage).iter().map(|j| j.name.clone()).collect();
        println!("    - {} ({})", stage, jobs.join(", "));
    }
    Ok(())
}

fn commit_context(args: &ContextArgs, settings: &CliSettings) -> Result<CommitContext> {
    let project = match args.project.clone().or_else(|| settings.project.clone()) {
        Some(project) => project,
        None => std::env::current_dir()?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string()),
    };
    let mut context = CommitContext::from_parts(args.branch.clone(), args.tag.clone(), &args.sha, project)?;
    if let Some(actor) = &args.actor {
        context = context.with_actor(actor);
    }
    Ok(context)
}

/// Show what a run would do.
pub fn plan(path: &Path, args: &ContextArgs, settings: &CliSettings) -> Result<()> {
    let definition = load_definition(path)?;
    let context = commit_context(args, settings)?;
    let plan = conveyor_scheduler::plan::plan_run(&definition, &context, &settings.engine_config(None)?)?;
    display::print_plan(&plan);
    Ok(())
}

/// How `run` answers approval gates.
struct ApprovalAnswers {
    approve: Vec<String>,
    reject: Vec<String>,
    interactive: bool,
}

enum Decision {
    Approve,
    Reject,
    Wait,
}

impl ApprovalAnswers {
    fn preset(&self, job: &str) -> Option<Decision> {
        if self.approve.iter().any(|j| j == job) {
            Some(Decision::Approve)
        } else if self.reject.iter().any(|j| j == job) {
            Some(Decision::Reject)
        } else {
            None
        }
    }
}

fn prompt(request: &ApprovalRequestedPayload) -> Decision {
    let target = request
        .environment
        .as_deref()
        .map(|e| format!(" to {e}"))
        .unwrap_or_default();
    let choice = dialoguer::Select::new()
        .with_prompt(format!("Job {}{target} is waiting for approval", request.job))
        .items(&["Approve", "Reject", "Leave pending"])
        .default(0)
        .interact();
    match choice {
        Ok(0) => Decision::Approve,
        Ok(1) => Decision::Reject,
        _ => Decision::Wait,
    }
}

/// Who decides gates from this terminal: `--approver`, else the OS user.
/// Independent of the run's actor.
fn approver_identity(flag: Option<&str>, var: impl Fn(&str) -> Option<String>) -> String {
    flag.map(str::to_string)
        .or_else(|| var("USER"))
        .or_else(|| var("USERNAME"))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "cli".to_string())
}

/// Answer gates one at a time so prompts never overlap.
fn spawn_approver(
    engine: Engine,
    answers: ApprovalAnswers,
    approver: String,
) -> mpsc::UnboundedSender<ApprovalRequestedPayload> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ApprovalRequestedPayload>();
    let answers = Arc::new(answers);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let decision = match answers.preset(&request.job) {
                Some(decision) => decision,
                None if answers.interactive => {
                    let request = request.clone();
                    tokio::task::spawn_blocking(move || prompt(&request))
                        .await
                        .unwrap_or(Decision::Wait)
                }
                None => {
                    println!(
                        "{} {} is waiting for approval; rerun with --approve {} or press Ctrl-C",
                        style("⏸").yellow(),
                        request.job,
                        request.job
                    );
                    Decision::Wait
                }
            };
            let result = match decision {
                Decision::Approve => engine.approve(request.token, &approver, None).await.map(|_| ()),
                Decision::Reject => engine
                    .reject(request.token, &approver, Some("rejected from the CLI".to_string()))
                    .await
                    .map(|_| ()),
                Decision::Wait => Ok(()),
            };
            if let Err(e) = result {
                println!("{} {}: {e}", style("✗").red(), request.job);
            }
        }
    });
    tx
}

fn print_event(event: &Event) {
    match event {
        Event::JobStatusChanged(p) => {
            let mut line = format!("{} {} {}", style("•").dim(), p.job, display::job_status(p.status));
            if let Some(reason) = &p.reason {
                line.push_str(&format!(" {}", style(reason).dim()));
            }
            println!("{line}");
        }
        Event::JobRetrying(p) => println!(
            "{} {} attempt {} failed, retrying in {}ms",
            style("↻").yellow(),
            p.job,
            p.failed_attempt,
            p.delay_ms
        ),
        Event::DeploymentFinished(p) if p.succeeded => println!(
            "{} deployed to {}{}",
            style("✓").green(),
            p.environment,
            p.url.as_deref().map(|u| format!(" ({u})")).unwrap_or_default()
        ),
        Event::RunCanceled(p) => println!("{} run canceled: {}", style("!").yellow(), p.reason),
        _ => {}
    }
}

pub struct RunOptions {
    pub approve: Vec<String>,
    pub reject: Vec<String>,
    pub approver: Option<String>,
    pub no_input: bool,
    pub engine_config: Option<std::path::PathBuf>,
}

/// Run a pipeline locally until it finishes or Ctrl-C cancels it.
pub async fn run(path: &Path, args: &ContextArgs, settings: &CliSettings, options: RunOptions) -> Result<()> {
    let definition = load_definition(path)?;
    let context = commit_context(args, settings)?;
    let engine_config: EngineConfig = settings.engine_config(options.engine_config.as_deref())?;

    let (log_tx, mut log_rx) = mpsc::unbounded_channel();
    let runtime = build_runtime(&settings.runner_config(), Some(log_tx))?;

    let store = match &settings.artifacts_dir {
        Some(dir) => FilesystemArtifactStore::new(dir),
        None => FilesystemArtifactStore::default_location(),
    };
    match store.purge_expired().await {
        Ok(purged) => debug!(purged, "Purged expired artifacts"),
        Err(e) => warn!(error = %e, "Could not purge expired artifacts"),
    }

    let mut builder = Engine::builder()
        .config(engine_config)
        .runtime(runtime)
        .artifact_store(Arc::new(store));
    if let Some(url) = &settings.quality_gate_url {
        let gate = HttpQualityGate::new(QualityGateConfig {
            url: url.clone(),
            token: std::env::var("CONVEYOR_QUALITY_GATE_TOKEN").ok(),
            timeout_secs: 600,
        })?;
        builder = builder.quality_gate(Arc::new(gate));
    }
    let engine = builder.build()?;
    let bus: Arc<dyn EventBus> = engine.event_bus();

    let notifier = Notifier::from_config(&settings.notifier_config()?);
    let notifier = if notifier.channel_count() > 0 {
        Some(Arc::new(notifier).spawn(bus.clone()).await?)
    } else {
        None
    };

    let printer = tokio::spawn(async move {
        while let Some(line) = log_rx.recv().await {
            display::print_log_line(&line);
        }
    });

    let mut events = bus.subscribe(">").await?;
    let approver = approver_identity(options.approver.as_deref(), |key| std::env::var(key).ok());
    if context.actor() == Some(approver.as_str()) {
        warn!(approver = %approver, "Approver is also the run's actor; self-approval policies will deny it");
    }
    let approvals = spawn_approver(
        engine.clone(),
        ApprovalAnswers {
            approve: options.approve,
            reject: options.reject,
            interactive: !options.no_input && console::user_attended(),
        },
        approver,
    );

    let handle = engine.start(&definition, &context)?;
    println!(
        "{} Running {} on {} ({})",
        style("▶").cyan(),
        style(&definition.name).bold(),
        style(context.ref_name()).dim(),
        handle.id()
    );

    {
        let finished = handle.wait_for(|run| run.status.is_terminal());
        tokio::pin!(finished);
        let mut interrupted = false;
        loop {
            tokio::select! {
                result = &mut finished => {
                    result?;
                    break;
                }
                signal = tokio::signal::ctrl_c(), if !interrupted => {
                    if signal.is_ok() {
                        interrupted = true;
                        println!("{} Canceling run", style("!").yellow());
                        handle.cancel("interrupted from the terminal");
                    }
                }
                Some(event) = events.next() => match event {
                    Ok(Event::ApprovalRequested(request)) if request.run_id == handle.id() => {
                        let _ = approvals.send(request);
                    }
                    Ok(event) if event.run_id() == handle.id() => print_event(&event),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Event stream error"),
                },
            }
        }
    }

    let run = handle.wait().await?;
    if let Some(notifier) = notifier {
        notifier.shutdown(Duration::from_secs(10)).await;
    }
    // The engine owns the runtime and with it the log sender.
    drop(approvals);
    drop(engine);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    display::print_summary(&run);
    match run.status {
        RunStatus::Success | RunStatus::Skipped => Ok(()),
        status => bail!("pipeline finished with status {status}"),
    }
}

/// Print the JSON schema of pipeline definitions.
pub fn schema() -> Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

pub fn show_config(settings: &CliSettings) -> Result<()> {
    println!("Current settings:");
    print!("{}", serde_yaml::to_string(settings)?);
    if let Ok(path) = CliSettings::config_path() {
        println!("\nConfig file: {}", path.display());
    }
    Ok(())
}

pub fn set_config(key: &str, value: &str) -> Result<()> {
    let mut settings = CliSettings::load()?;
    settings.set(key, value)?;
    settings.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}
