//! Declarative rule tables.
//!
//! A rule table is an ordered list of entries. Each entry has an optional
//! predicate (`if`), variable assignments and an applicability (`when`).
//! Entries are evaluated top to bottom and the first match wins. A non-empty
//! table that matches nothing yields a skip verdict; an empty table does not
//! gate anything.

use crate::context::CommitContext;
use crate::interpolation::InterpolationContext;
use crate::{Error, Result};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Condition over the commit context and the resolved variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Exact branch name.
    Branch(String),
    /// Branch name matches a regex.
    BranchMatches(String),
    /// Exact tag name.
    Tag(String),
    /// Tag name matches a regex.
    TagMatches(String),
    /// Variable equals a value.
    Variable { name: String, equals: String },
    /// Variable matches a regex.
    VariableMatches { name: String, pattern: String },
    /// Variable is set and non-empty.
    Exists(String),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

/// Applicability of a job once its rules matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum When {
    #[default]
    OnSuccess,
    Manual,
    Never,
}

/// One entry of a rule table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Rule {
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Predicate>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_failure: Option<bool>,
}

impl Rule {
    pub fn matching(condition: Predicate) -> Self {
        Self {
            condition: Some(condition),
            ..Default::default()
        }
    }

    pub fn never() -> Self {
        Self {
            when: Some(When::Never),
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_when(mut self, when: When) -> Self {
        self.when = Some(when);
        self
    }
}

/// Pipeline-level rule table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Workflow {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Result of evaluating a rule table.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleVerdict {
    Run(RuleMatch),
    Skip(SkipReason),
}

impl RuleVerdict {
    pub fn is_skip(&self) -> bool {
        matches!(self, RuleVerdict::Skip(_))
    }

    /// Variables assigned by the matching rule, if any.
    pub fn variables(&self) -> HashMap<String, String> {
        match self {
            RuleVerdict::Run(m) => m.variables.clone(),
            RuleVerdict::Skip(_) => HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleMatch {
    /// Index of the matching entry. `None` when the table was empty.
    pub index: Option<usize>,
    pub variables: HashMap<String, String>,
    pub when: Option<When>,
    pub allow_failure: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No entry matched.
    NoMatch,
    /// The matching entry says `when: never`.
    Never { index: usize },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoMatch => write!(f, "no rule matched"),
            SkipReason::Never { index } => write!(f, "rule #{} says never", index + 1),
        }
    }
}

#[derive(Debug)]
enum Compiled {
    Branch(String),
    BranchMatches(Regex),
    Tag(String),
    TagMatches(Regex),
    Variable { name: String, equals: String },
    VariableMatches { name: String, pattern: Regex },
    Exists(String),
    All(Vec<Compiled>),
    Any(Vec<Compiled>),
    Not(Box<Compiled>),
}

impl Compiled {
    fn compile(predicate: &Predicate) -> Result<Self> {
        Ok(match predicate {
            Predicate::Branch(b) => Compiled::Branch(b.clone()),
            Predicate::BranchMatches(p) => Compiled::BranchMatches(compile_regex(p)?),
            Predicate::Tag(t) => Compiled::Tag(t.clone()),
            Predicate::TagMatches(p) => Compiled::TagMatches(compile_regex(p)?),
            Predicate::Variable { name, equals } => Compiled::Variable {
                name: name.clone(),
                equals: equals.clone(),
            },
            Predicate::VariableMatches { name, pattern } => Compiled::VariableMatches {
                name: name.clone(),
                pattern: compile_regex(pattern)?,
            },
            Predicate::Exists(name) => Compiled::Exists(name.clone()),
            Predicate::All(ps) => {
                Compiled::All(ps.iter().map(Compiled::compile).collect::<Result<_>>()?)
            }
            Predicate::Any(ps) => {
                Compiled::Any(ps.iter().map(Compiled::compile).collect::<Result<_>>()?)
            }
            Predicate::Not(p) => Compiled::Not(Box::new(Compiled::compile(p)?)),
        })
    }

    fn matches(&self, ctx: &CommitContext, vars: &HashMap<String, String>) -> bool {
        match self {
            Compiled::Branch(b) => ctx.branch_name() == Some(b.as_str()),
            Compiled::BranchMatches(re) => ctx.branch_name().is_some_and(|b| re.is_match(b)),
            Compiled::Tag(t) => ctx.tag_name() == Some(t.as_str()),
            Compiled::TagMatches(re) => ctx.tag_name().is_some_and(|t| re.is_match(t)),
            Compiled::Variable { name, equals } => vars.get(name).is_some_and(|v| v == equals),
            Compiled::VariableMatches { name, pattern } => {
                vars.get(name).is_some_and(|v| pattern.is_match(v))
            }
            Compiled::Exists(name) => vars.get(name).is_some_and(|v| !v.is_empty()),
            Compiled::All(ps) => ps.iter().all(|p| p.matches(ctx, vars)),
            Compiled::Any(ps) => ps.iter().any(|p| p.matches(ctx, vars)),
            Compiled::Not(p) => !p.matches(ctx, vars),
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::InvalidRule(format!("bad pattern '{pattern}': {e}")))
}

#[derive(Debug)]
struct CompiledRule {
    condition: Option<Compiled>,
    rule: Rule,
}

/// A rule table with its regexes compiled. Evaluation is pure.
#[derive(Debug)]
pub struct RuleEvaluator {
    rules: Vec<CompiledRule>,
}

impl RuleEvaluator {
    pub fn new(rules: &[Rule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    condition: rule.condition.as_ref().map(Compiled::compile).transpose()?,
                    rule: rule.clone(),
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate against a context and the variables visible at this point.
    ///
    /// Assigned variables are interpolated against `vars`.
    pub fn evaluate(&self, ctx: &CommitContext, vars: &HashMap<String, String>) -> RuleVerdict {
        if self.rules.is_empty() {
            return RuleVerdict::Run(RuleMatch::default());
        }

        let matched = self.rules.iter().enumerate().find(|(_, r)| {
            r.condition
                .as_ref()
                .is_none_or(|condition| condition.matches(ctx, vars))
        });

        let Some((index, compiled)) = matched else {
            return RuleVerdict::Skip(SkipReason::NoMatch);
        };

        let rule = &compiled.rule;
        if rule.when == Some(When::Never) {
            return RuleVerdict::Skip(SkipReason::Never { index });
        }

        let interpolation = InterpolationContext::with_variables(vars.clone());
        RuleVerdict::Run(RuleMatch {
            index: Some(index),
            variables: interpolation.interpolate_map(&rule.variables),
            when: rule.when,
            allow_failure: rule.allow_failure,
        })
    }
}
