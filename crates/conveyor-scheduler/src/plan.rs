//! Per-run job instantiation.
//!
//! Variables are layered as pipeline < predefined `CI_*` < workflow < job <
//! job rule, and the job rule table is evaluated against that layered map.

use crate::config::EngineConfig;
use crate::dag::StageGraph;
use conveyor_core::approval::ApprovalPolicy;
use conveyor_core::context::CommitContext;
use conveyor_core::environment::ResolvedEnvironment;
use conveyor_core::ids::RunId;
use conveyor_core::interpolation::InterpolationContext;
use conveyor_core::pipeline::{Job, PipelineDefinition};
use conveyor_core::rules::{RuleEvaluator, RuleVerdict, When};
use conveyor_core::Result;
use std::collections::HashMap;
use tracing::debug;

/// A job as it will run in one pipeline run.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub job: Job,
    /// `on_success` or `manual`; `never` only appears on skipped jobs.
    pub when: When,
    pub allow_failure: bool,
    /// Fully layered variables handed to the runtime.
    pub variables: HashMap<String, String>,
    pub environment: Option<ResolvedEnvironment>,
    /// Token key for serialized execution.
    pub resource_key: Option<String>,
    /// Policy for the approval gate of a manual job.
    pub approval: ApprovalPolicy,
    /// Set when the job will not run in this run.
    pub skip_reason: Option<String>,
}

impl PlannedJob {
    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }

    pub fn is_manual(&self) -> bool {
        self.when == When::Manual
    }
}

/// Everything decided before the first job starts.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: RunId,
    pub pipeline: String,
    pub context: CommitContext,
    /// Pipeline-level variables after the workflow rules.
    pub variables: HashMap<String, String>,
    /// Why the workflow rules skipped the whole run.
    pub workflow_skip: Option<String>,
    pub graph: StageGraph,
    /// Jobs in declaration order.
    pub jobs: Vec<PlannedJob>,
    /// Job timeout applied when the job sets none.
    pub default_timeout_minutes: u32,
}

impl RunPlan {
    pub fn job(&self, name: &str) -> Option<&PlannedJob> {
        self.jobs.iter().find(|j| j.job.name == name)
    }

    /// The run will execute at least one job.
    pub fn has_runnable_jobs(&self) -> bool {
        self.jobs.iter().any(|j| !j.is_skipped())
    }
}

/// Build the plan of a run of `definition` for `context`.
pub fn plan_run(
    definition: &PipelineDefinition,
    context: &CommitContext,
    config: &EngineConfig,
) -> Result<RunPlan> {
    let graph = StageGraph::build(definition)?;
    let run_id = RunId::new();

    let mut base = InterpolationContext::new();
    base.layer(&definition.variables);
    base.layer(&context.predefined_variables());
    base.variables.insert("CI_PIPELINE_ID".to_string(), run_id.to_string());
    base.variables.insert("CI_PIPELINE_NAME".to_string(), definition.name.clone());

    let workflow = RuleEvaluator::new(&definition.workflow.rules)?;
    let workflow_verdict = workflow.evaluate(context, &base.variables);
    let workflow_skip = match &workflow_verdict {
        RuleVerdict::Skip(reason) => Some(format!("workflow rules: {reason}")),
        RuleVerdict::Run(_) => None,
    };
    base.layer(&workflow_verdict.variables());
    debug!(pipeline = %definition.name, skip = ?workflow_skip, "Workflow rules evaluated");

    let jobs = graph
        .jobs()
        .into_iter()
        .map(|job| plan_job(job, definition, context, &base, workflow_skip.as_deref(), config))
        .collect::<Result<Vec<_>>>()?;

    Ok(RunPlan {
        run_id,
        pipeline: definition.name.clone(),
        context: context.clone(),
        variables: base.variables,
        workflow_skip,
        graph,
        jobs,
        default_timeout_minutes: definition
            .timeout_minutes
            .unwrap_or(config.default_job_timeout_minutes),
    })
}

fn plan_job(
    job: &Job,
    definition: &PipelineDefinition,
    context: &CommitContext,
    base: &InterpolationContext,
    workflow_skip: Option<&str>,
    config: &EngineConfig,
) -> Result<PlannedJob> {
    let mut interp = base.clone();
    interp.variables.insert("CI_JOB_NAME".to_string(), job.name.clone());
    interp.variables.insert("CI_JOB_STAGE".to_string(), job.stage.clone());
    let job_vars = interp.interpolate_map(&job.variables);
    interp.layer(&job_vars);

    let verdict = RuleEvaluator::new(&job.rules)?.evaluate(context, &interp.variables);
    interp.layer(&verdict.variables());

    let (when, allow_failure, mut skip_reason) = match verdict {
        RuleVerdict::Skip(reason) => (job.when, job.allow_failure, Some(format!("rules: {reason}"))),
        RuleVerdict::Run(matched) => (
            matched.when.unwrap_or(job.when),
            matched.allow_failure.unwrap_or(job.allow_failure),
            None,
        ),
    };
    if when == When::Never && skip_reason.is_none() {
        skip_reason = Some("when: never".to_string());
    }
    if let Some(reason) = workflow_skip {
        skip_reason = Some(reason.to_string());
    }

    // Skipped jobs may reference variables that were never set.
    let environment = match (&job.environment, &skip_reason) {
        (Some(binding), None) => Some(ResolvedEnvironment::resolve(
            binding,
            &definition.environments,
            &interp,
        )?),
        _ => None,
    };
    if let Some(env) = &environment {
        interp.variables.insert("CI_ENVIRONMENT_NAME".to_string(), env.name.clone());
        if let Some(url) = &env.url {
            interp.variables.insert("CI_ENVIRONMENT_URL".to_string(), url.clone());
        }
    }

    let resource_key = job
        .resource_group
        .as_deref()
        .map(|group| interp.interpolate(group))
        .filter(|group| !group.is_empty())
        .or_else(|| {
            environment
                .as_ref()
                .filter(|env| env.protected)
                .map(|env| env.group_key.clone())
        });

    let approval = environment
        .as_ref()
        .and_then(|env| env.approval.clone())
        .unwrap_or_else(|| config.approval.clone());

    Ok(PlannedJob {
        job: job.clone(),
        when,
        allow_failure,
        variables: interp.variables,
        environment,
        resource_key,
        approval,
        skip_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
name: webapp
variables: { APP: webapp }
workflow:
  rules:
    - if: { branch: development }
      variables: { TARGET_ENV: dev }
    - if: { tag_matches: '^\d+\.\d+\.\d+$' }
      variables: { TARGET_ENV: production }
    - when: never
stages: [build, deploy]
environments:
  - { name: production, protected: true, approval: { approvers: [release-manager] } }
jobs:
  - name: build
    stage: build
    script: [make]
    variables: { OUT: "dist/$APP" }
  - name: deploy_review
    stage: deploy
    script: [./deploy.sh]
    environment: { name: "review/$CI_COMMIT_REF_SLUG", url: "https://$CI_COMMIT_REF_SLUG.example.com" }
    rules:
      - if: { variable: { name: TARGET_ENV, equals: dev } }
      - when: never
  - name: deploy_production
    stage: deploy
    script: [./deploy.sh]
    environment: { name: production }
    rules:
      - if: { variable: { name: TARGET_ENV, equals: production } }
        when: manual
      - when: never
"#;

    fn plan_for(context: &CommitContext) -> RunPlan {
        let definition = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        plan_run(&definition, context, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_branch_plan() {
        let plan = plan_for(&CommitContext::branch("development", "0123456789ab", "group/webapp"));
        assert_eq!(plan.workflow_skip, None);
        assert_eq!(plan.variables["TARGET_ENV"], "dev");

        let build = plan.job("build").unwrap();
        assert_eq!(build.variables["OUT"], "dist/webapp");
        assert_eq!(build.variables["CI_JOB_NAME"], "build");

        let review = plan.job("deploy_review").unwrap();
        assert!(!review.is_skipped());
        let env = review.environment.as_ref().unwrap();
        assert_eq!(env.name, "review/development");
        assert_eq!(env.url.as_deref(), Some("https://development.example.com"));
        assert_eq!(review.resource_key, None);
        assert_eq!(review.variables["CI_ENVIRONMENT_NAME"], "review/development");

        assert!(plan.job("deploy_production").unwrap().is_skipped());
    }

    #[test]
    fn test_tag_plan() {
        let plan = plan_for(&CommitContext::tag("1.2.3", "0123456789ab", "group/webapp"));
        let production = plan.job("deploy_production").unwrap();
        assert!(production.is_manual());
        assert_eq!(production.resource_key.as_deref(), Some("production"));
        assert_eq!(production.approval.approvers, vec!["release-manager".to_string()]);
        assert!(plan.job("deploy_review").unwrap().is_skipped());
    }

    #[test]
    fn test_workflow_skip_skips_every_job() {
        let plan = plan_for(&CommitContext::branch("feature/x", "0123456789ab", "group/webapp"));
        assert!(plan.workflow_skip.is_some());
        assert!(!plan.has_runnable_jobs());
        let names: Vec<_> = plan.jobs.iter().map(|j| j.name().to_string()).collect();
        assert_eq!(names, vec!["build", "deploy_review", "deploy_production"]);
    }

    #[test]
    fn test_resource_group_overrides_environment_key() {
        let yaml = r#"
name: infra
stages: [apply]
environments: [{ name: production, protected: true, concurrency_group: prod-eu }]
jobs:
  - { name: plan, stage: apply, script: [x], resource_group: "terraform-$CI_COMMIT_REF_SLUG" }
  - { name: apply, stage: apply, script: [x], environment: { name: production } }
"#;
        let definition = PipelineDefinition::from_yaml(yaml).unwrap();
        let context = CommitContext::branch("main", "abc", "group/infra");
        let plan = plan_run(&definition, &context, &EngineConfig::default()).unwrap();
        assert_eq!(plan.job("plan").unwrap().resource_key.as_deref(), Some("terraform-main"));
        assert_eq!(plan.job("apply").unwrap().resource_key.as_deref(), Some("prod-eu"));
        assert_eq!(plan.default_timeout_minutes, 60);
    }
}
