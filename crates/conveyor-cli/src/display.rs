//! Terminal rendering of plans, events and results.

use console::{StyledObject, style};
use conveyor_core::run::{JobStatus, PipelineRun, RunStatus};
use conveyor_runner::{OutputLine, OutputStream};
use conveyor_scheduler::{PlannedJob, RunPlan};

pub fn job_status(status: JobStatus) -> StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        JobStatus::Succeeded => style(text).green(),
        JobStatus::Failed | JobStatus::Blocked => style(text).red(),
        JobStatus::Running => style(text).cyan(),
        JobStatus::WaitingForApproval | JobStatus::WaitingForResource => style(text).yellow(),
        _ => style(text).dim(),
    }
}

pub fn run_status(status: RunStatus) -> StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        RunStatus::Success => style(text).green().bold(),
        RunStatus::Failed => style(text).red().bold(),
        _ => style(text).yellow().bold(),
    }
}

fn describe(job: &PlannedJob) -> String {
    let mut parts = Vec::new();
    if job.is_manual() {
        parts.push("manual".to_string());
    }
    if job.allow_failure {
        parts.push("allow_failure".to_string());
    }
    if let Some(env) = &job.environment {
        let mut text = format!("env {}", env.name);
        if let Some(url) = &env.url {
            text.push_str(&format!(" ({url})"));
        }
        if env.protected {
            text.push_str(" protected");
        }
        parts.push(text);
    }
    if let Some(key) = &job.resource_key {
        parts.push(format!("token {key}"));
    }
    parts.join(", ")
}

pub fn print_plan(plan: &RunPlan) {
    println!(
        "{} {} for {}",
        style("Plan").bold(),
        style(&plan.pipeline).cyan(),
        style(plan.context.ref_name()).dim()
    );
    if let Some(reason) = &plan.workflow_skip {
        println!("  {} {}", style("!").yellow(), reason);
    }
    let mut selected: Vec<_> = plan
        .variables
        .iter()
        .filter(|(k, _)| !k.starts_with("CI_"))
        .collect();
    selected.sort();
    for (key, value) in selected {
        println!("  {key}={value}");
    }

    for stage in plan.graph.stages() {
        println!("\n{}", style(stage).bold());
        for job in plan.jobs.iter().filter(|j| &j.job.stage == stage) {
            match &job.skip_reason {
                Some(reason) => println!("  {} {} {}", style("-").dim(), style(job.name()).dim(), style(reason).dim()),
                None => {
                    let details = describe(job);
                    if details.is_empty() {
                        println!("  {} {}", style("+").green(), job.name());
                    } else {
                        println!("  {} {} {}", style("+").green(), job.name(), style(details).dim());
                    }
                }
            }
        }
    }
}

pub fn print_log_line(line: &OutputLine) {
    let prefix = style(format!("[{}]", line.job)).dim();
    match line.stream {
        OutputStream::Stdout => println!("{prefix} {}", line.content),
        OutputStream::Stderr => eprintln!("{prefix} {}", style(&line.content).red()),
    }
}

pub fn print_summary(run: &PipelineRun) {
    println!();
    for stage in &run.stages {
        println!("{}", style(stage).bold());
        for job in run.jobs.iter().filter(|j| &j.stage == stage) {
            let duration = job
                .duration_ms()
                .map(|ms| format!(" {:.1}s", ms as f64 / 1000.0))
                .unwrap_or_default();
            let attempts = if job.attempts.len() > 1 {
                format!(" ({} attempts)", job.attempts.len())
            } else {
                String::new()
            };
            println!("  {:<24} {}{}{}", job.name, job_status(job.status), style(duration).dim(), attempts);
            if let Some(reason) = &job.reason {
                println!("  {:<24} {}", "", style(reason).dim());
            }
        }
    }
    println!("\nPipeline {} {}", style(&run.pipeline).cyan(), run_status(run.status));
}
