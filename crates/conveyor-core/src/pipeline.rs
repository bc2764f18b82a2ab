//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML. Job templates are
//! merged into concrete [`Job`]s by [`PipelineDefinition::resolve_jobs`].

use crate::environment::{EnvironmentBinding, EnvironmentPolicy};
use crate::error::FailureClass;
use crate::rules::{Rule, RuleEvaluator, When, Workflow};
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub workflow: Workflow,
    pub stages: Vec<String>,
    #[serde(default)]
    pub environments: Vec<EnvironmentPolicy>,
    #[serde(default)]
    pub templates: HashMap<String, JobSpec>,
    pub jobs: Vec<JobDefinition>,
    /// Default job timeout. The engine default applies when unset.
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

/// A job as written: a name, the templates it extends and its own fields.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(flatten)]
    pub spec: JobSpec,
}

/// Job fields shared by templates and job definitions.
///
/// Every field is optional so templates can be layered. Scalars and lists
/// from later layers replace earlier ones; `variables` merge key by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_script: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs: Option<Vec<NeedSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Rule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gate: Option<QualityGateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<bool>,
}

impl JobSpec {
    /// Layer `over` on top of `self`.
    pub fn merge(mut self, over: &JobSpec) -> JobSpec {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if over.$field.is_some() { self.$field = over.$field.clone(); })*
            };
        }
        take!(
            stage,
            image,
            before_script,
            script,
            needs,
            retry,
            when,
            rules,
            cache,
            artifacts,
            environment,
            resource_group,
            timeout_minutes,
            allow_failure,
            quality_gate,
            resources,
            tags,
            notify
        );
        for (key, value) in &over.variables {
            self.variables.insert(key.clone(), value.clone());
        }
        self
    }
}

/// A `needs` entry: a bare job name or the detailed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum NeedSpec {
    Name(String),
    Detailed(Need),
}

impl NeedSpec {
    pub fn into_need(self) -> Need {
        match self {
            NeedSpec::Name(job) => Need {
                job,
                artifacts: true,
                optional: false,
            },
            NeedSpec::Detailed(need) => need,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Need {
    pub job: String,
    /// Download the dependency's artifacts before running.
    #[serde(default = "default_true")]
    pub artifacts: bool,
    /// A skipped or absent dependency does not skip this job.
    #[serde(default)]
    pub optional: bool,
}

fn default_true() -> bool {
    true
}

/// `retry: 2` or `retry: { max: 2, when: [script_failure] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RetrySpec {
    Max(u32),
    Detailed(RetryPolicy),
}

impl RetrySpec {
    pub fn into_policy(self) -> RetryPolicy {
        match self {
            RetrySpec::Max(max) => RetryPolicy {
                max,
                when: Vec::new(),
            },
            RetrySpec::Detailed(policy) => policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    #[serde(default)]
    pub max: u32,
    /// Non-transient classes that are also retried.
    #[serde(default)]
    pub when: Vec<FailureClass>,
}

impl RetryPolicy {
    /// Total number of attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max + 1
    }

    /// Whether a failure of `class` may be retried under this policy.
    pub fn allows(&self, class: FailureClass) -> bool {
        if class.is_never_retryable() {
            return false;
        }
        class.is_transient() || self.when.contains(&class)
    }

    /// Whether another attempt should follow failed attempt number `attempt` (1-based).
    pub fn should_retry(&self, class: FailureClass, attempt: u32) -> bool {
        attempt < self.max_attempts() && self.allows(class)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct CacheSpec {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactSpec {
    pub paths: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_expire_in_days")]
    pub expire_in_days: u32,
}

fn default_expire_in_days() -> u32 {
    7
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct QualityGateSpec {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub coverage_report: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// A job with templates applied and defaults filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub name: String,
    pub stage: String,
    pub image: Option<String>,
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    /// `None` waits for every job of earlier stages. `Some(vec![])` starts immediately.
    pub needs: Option<Vec<Need>>,
    pub retry: RetryPolicy,
    pub when: When,
    pub rules: Vec<Rule>,
    pub cache: Option<CacheSpec>,
    pub artifacts: Option<ArtifactSpec>,
    pub environment: Option<EnvironmentBinding>,
    pub resource_group: Option<String>,
    pub variables: HashMap<String, String>,
    pub timeout_minutes: Option<u32>,
    pub allow_failure: bool,
    pub quality_gate: Option<QualityGateSpec>,
    pub resources: Option<ResourceRequirements>,
    pub tags: Vec<String>,
    pub notify: bool,
}

impl Job {
    fn from_spec(name: String, spec: JobSpec) -> Result<Self> {
        let stage = spec
            .stage
            .ok_or_else(|| Error::InvalidPipeline(format!("job '{name}' has no stage")))?;
        let script = spec.script.unwrap_or_default();
        if script.is_empty() {
            return Err(Error::InvalidPipeline(format!("job '{name}' has an empty script")));
        }

        let retry = spec.retry.map(RetrySpec::into_policy).unwrap_or_default();
        if retry.max > MAX_RETRIES {
            return Err(Error::InvalidPipeline(format!(
                "job '{name}' retries {} times, the limit is {MAX_RETRIES}",
                retry.max
            )));
        }

        Ok(Self {
            stage,
            image: spec.image,
            before_script: spec.before_script.unwrap_or_default(),
            script,
            needs: spec
                .needs
                .map(|needs| needs.into_iter().map(NeedSpec::into_need).collect()),
            retry,
            when: spec.when.unwrap_or_default(),
            rules: spec.rules.unwrap_or_default(),
            cache: spec.cache,
            artifacts: spec.artifacts,
            environment: spec.environment,
            resource_group: spec.resource_group,
            variables: spec.variables,
            timeout_minutes: spec.timeout_minutes,
            allow_failure: spec.allow_failure.unwrap_or(false),
            quality_gate: spec.quality_gate,
            resources: spec.resources,
            tags: spec.tags.unwrap_or_default(),
            notify: spec.notify.unwrap_or(true),
            name,
        })
    }

    pub fn is_manual(&self) -> bool {
        self.when == When::Manual
    }

    /// Full command list, `before_script` first.
    pub fn commands(&self) -> Vec<String> {
        self.before_script
            .iter()
            .chain(self.script.iter())
            .cloned()
            .collect()
    }
}

impl PipelineDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(yaml)?;
        Ok(definition)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Merge templates into each job, in `extends` order.
    pub fn resolve_jobs(&self) -> Result<Vec<Job>> {
        self.jobs
            .iter()
            .map(|definition| {
                let mut spec = JobSpec::default();
                for template in &definition.extends {
                    let base = self.templates.get(template).ok_or_else(|| {
                        Error::InvalidPipeline(format!(
                            "job '{}' extends unknown template '{template}'",
                            definition.name
                        ))
                    })?;
                    spec = spec.merge(base);
                }
                spec = spec.merge(&definition.spec);
                Job::from_spec(definition.name.clone(), spec)
            })
            .collect()
    }

    /// Structural checks that do not need the job graph.
    ///
    /// Dependency checks (unknown needs, cycles, stage ordering) happen when
    /// the stage graph is built.
    pub fn validate(&self) -> Result<Vec<Job>> {
        if self.name.trim().is_empty() {
            return Err(Error::PipelineValidation("pipeline name is empty".into()));
        }
        if self.stages.is_empty() {
            return Err(Error::PipelineValidation("no stages declared".into()));
        }

        let mut stages = HashSet::new();
        for stage in &self.stages {
            if !stages.insert(stage.as_str()) {
                return Err(Error::PipelineValidation(format!("duplicate stage '{stage}'")));
            }
        }

        RuleEvaluator::new(&self.workflow.rules)?;

        let jobs = self.resolve_jobs()?;
        let mut names = HashSet::new();
        for job in &jobs {
            if job.name.starts_with('.') {
                return Err(Error::PipelineValidation(format!(
                    "job '{}' uses a template name",
                    job.name
                )));
            }
            if !names.insert(job.name.as_str()) {
                return Err(Error::PipelineValidation(format!("duplicate job '{}'", job.name)));
            }
            if !stages.contains(job.stage.as_str()) {
                return Err(Error::PipelineValidation(format!(
                    "job '{}' uses unknown stage '{}'",
                    job.name, job.stage
                )));
            }
            RuleEvaluator::new(&job.rules)?;
        }

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
name: webapp
variables:
  IMAGE_NAME: registry.example.com/webapp
stages: [build, deploy]
templates:
  .deploy:
    image: alpine:3.20
    retry: { max: 2, when: [script_failure] }
    variables: { STRATEGY: rolling, REPLICAS: "2" }
    notify: false
jobs:
  - name: build
    stage: build
    script: ["docker build -t $IMAGE_NAME ."]
    artifacts: { paths: [dist/] }
  - name: deploy_production
    extends: [.deploy]
    stage: deploy
    when: manual
    needs: [build]
    variables: { REPLICAS: "4" }
    notify: true
    script: ["./deploy.sh"]
    environment: { name: production, url: https://example.com }
"#;

    #[test]
    fn test_parse_and_resolve() {
        let definition = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        assert_eq!(definition.timeout_minutes, None);

        let jobs = definition.validate().unwrap();
        let build = &jobs[0];
        assert_eq!(build.artifacts.as_ref().map(|a| a.expire_in_days), Some(7));
        assert_eq!(build.needs, None);
        assert!(build.notify);

        let deploy = &jobs[1];
        assert!(deploy.is_manual());
        assert_eq!(deploy.image.as_deref(), Some("alpine:3.20"));
        assert_eq!(deploy.retry.max, 2);
        assert_eq!(deploy.variables["STRATEGY"], "rolling");
        assert_eq!(deploy.variables["REPLICAS"], "4");
        assert!(deploy.notify);
        assert_eq!(
            deploy.needs,
            Some(vec![Need {
                job: "build".into(),
                artifacts: true,
                optional: false,
            }])
        );
    }

    #[test]
    fn test_unknown_template() {
        let mut definition = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        definition.jobs[0].extends = vec![".missing".into()];
        assert!(matches!(definition.validate(), Err(Error::InvalidPipeline(_))));
    }

    #[test]
    fn test_unknown_stage() {
        let mut definition = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        definition.jobs[0].spec.stage = Some("package".into());
        assert!(matches!(definition.validate(), Err(Error::PipelineValidation(_))));
    }

    #[test]
    fn test_duplicate_job() {
        let mut definition = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        let copy = definition.jobs[0].clone();
        definition.jobs.push(copy);
        assert!(matches!(definition.validate(), Err(Error::PipelineValidation(_))));
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy {
            max: 2,
            when: vec![FailureClass::ScriptFailure],
        };
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.should_retry(FailureClass::ScriptFailure, 2));
        assert!(!policy.should_retry(FailureClass::ScriptFailure, 3));
        assert!(!policy.should_retry(FailureClass::QualityGateFailure, 1));

        let transient_only = RetrySpec::Max(1).into_policy();
        assert!(transient_only.should_retry(FailureClass::RunnerSystemFailure, 1));
        assert!(!transient_only.should_retry(FailureClass::ScriptFailure, 1));
    }

    #[test]
    fn test_merge_replaces_lists() {
        let base = JobSpec {
            tags: Some(vec!["docker".into(), "linux".into()]),
            script: Some(vec!["echo base".into()]),
            ..Default::default()
        };
        let over = JobSpec {
            tags: Some(vec!["arm".into()]),
            ..Default::default()
        };
        let merged = base.merge(&over);
        assert_eq!(merged.tags, Some(vec!["arm".to_string()]));
        assert_eq!(merged.script, Some(vec!["echo base".to_string()]));
    }
}
