//! Commit context consumed at pipeline trigger time.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MAX_SLUG_LEN: usize = 63;
const SHORT_SHA_LEN: usize = 8;

/// What caused the pipeline to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSource {
    #[default]
    Push,
    Tag,
    Api,
    Schedule,
    Manual,
}

impl PipelineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineSource::Push => "push",
            PipelineSource::Tag => "tag",
            PipelineSource::Api => "api",
            PipelineSource::Schedule => "schedule",
            PipelineSource::Manual => "manual",
        }
    }
}

/// The commit a pipeline run is built for. Immutable once a run starts.
///
/// Deserialization goes through [`CommitContext::from_parts`], so the
/// branch/tag exclusivity holds for contexts read from files too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "ContextFields")]
pub struct CommitContext {
    branch: Option<String>,
    tag: Option<String>,
    sha: String,
    project: String,
    #[serde(default)]
    source: PipelineSource,
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Deserialize)]
struct ContextFields {
    branch: Option<String>,
    tag: Option<String>,
    sha: String,
    project: String,
    #[serde(default)]
    source: Option<PipelineSource>,
    #[serde(default)]
    actor: Option<String>,
}

impl TryFrom<ContextFields> for CommitContext {
    type Error = Error;

    fn try_from(fields: ContextFields) -> Result<Self> {
        let mut context = Self::from_parts(fields.branch, fields.tag, fields.sha, fields.project)?;
        if let Some(source) = fields.source {
            context.source = source;
        }
        context.actor = fields.actor;
        Ok(context)
    }
}

impl CommitContext {
    /// Context for a branch push.
    pub fn branch(branch: impl Into<String>, sha: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            tag: None,
            sha: sha.into(),
            project: project.into(),
            source: PipelineSource::Push,
            actor: None,
        }
    }

    /// Context for a tag push.
    pub fn tag(tag: impl Into<String>, sha: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            branch: None,
            tag: Some(tag.into()),
            sha: sha.into(),
            project: project.into(),
            source: PipelineSource::Tag,
            actor: None,
        }
    }

    /// Build a context from optional parts, as a trigger adapter would.
    pub fn from_parts(
        branch: Option<String>,
        tag: Option<String>,
        sha: impl Into<String>,
        project: impl Into<String>,
    ) -> Result<Self> {
        let source = match (&branch, &tag) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidContext(
                    "branch and tag are mutually exclusive".to_string(),
                ));
            }
            (None, None) => {
                return Err(Error::InvalidContext(
                    "either a branch or a tag is required".to_string(),
                ));
            }
            (Some(_), None) => PipelineSource::Push,
            (None, Some(_)) => PipelineSource::Tag,
        };

        let sha = sha.into();
        if sha.is_empty() {
            return Err(Error::InvalidContext("commit sha is empty".to_string()));
        }

        Ok(Self {
            branch,
            tag,
            sha,
            project: project.into(),
            source,
            actor: None,
        })
    }

    pub fn with_source(mut self, source: PipelineSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn branch_name(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn tag_name(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn source(&self) -> PipelineSource {
        self.source
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    /// The branch or tag name.
    pub fn ref_name(&self) -> &str {
        self.branch
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or_default()
    }

    pub fn ref_slug(&self) -> String {
        slugify(self.ref_name())
    }

    pub fn short_sha(&self) -> &str {
        let end = self
            .sha
            .char_indices()
            .nth(SHORT_SHA_LEN)
            .map(|(i, _)| i)
            .unwrap_or(self.sha.len());
        &self.sha[..end]
    }

    /// Predefined `CI_*` variables derived from the context.
    pub fn predefined_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        if let Some(branch) = &self.branch {
            vars.insert("CI_COMMIT_BRANCH".to_string(), branch.clone());
        }
        if let Some(tag) = &self.tag {
            vars.insert("CI_COMMIT_TAG".to_string(), tag.clone());
        }
        vars.insert("CI_COMMIT_SHA".to_string(), self.sha.clone());
        vars.insert("CI_COMMIT_SHORT_SHA".to_string(), self.short_sha().to_string());
        vars.insert("CI_COMMIT_REF_NAME".to_string(), self.ref_name().to_string());
        vars.insert("CI_COMMIT_REF_SLUG".to_string(), self.ref_slug());
        vars.insert("CI_PROJECT_PATH".to_string(), self.project.clone());
        vars.insert(
            "CI_PIPELINE_SOURCE".to_string(),
            self.source.as_str().to_string(),
        );
        vars
    }
}

/// Lower-case a ref and collapse anything outside `[a-z0-9]` into `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for c in input.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
    }
    slug.trim_end_matches('-').to_string()
}
