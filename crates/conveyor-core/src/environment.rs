//! Deployment environments and their protection policies.

use crate::approval::ApprovalPolicy;
use crate::interpolation::InterpolationContext;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Protection policy for environments matching `name`.
///
/// `name` is an exact environment name or a prefix pattern ending in `*`
/// (`review/*`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentPolicy {
    pub name: String,
    /// Protected environments allow one deploy at a time per group key.
    #[serde(default)]
    pub protected: bool,
    /// Serialization key. Defaults to the environment name.
    #[serde(default)]
    pub concurrency_group: Option<String>,
    /// Who may approve manual deploys into this environment.
    #[serde(default)]
    pub approval: Option<ApprovalPolicy>,
}

impl EnvironmentPolicy {
    pub fn matches(&self, environment: &str) -> bool {
        match self.name.strip_suffix('*') {
            Some(prefix) => environment.starts_with(prefix),
            None => self.name == environment,
        }
    }
}

/// Environment declaration on a job. Both fields may reference variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentBinding {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// An environment after interpolation and policy lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedEnvironment {
    pub name: String,
    pub url: Option<String>,
    pub protected: bool,
    /// Token key for protected environments.
    pub group_key: String,
    pub approval: Option<ApprovalPolicy>,
}

impl ResolvedEnvironment {
    /// Interpolate a binding and attach the first matching policy.
    pub fn resolve(
        binding: &EnvironmentBinding,
        policies: &[EnvironmentPolicy],
        interpolation: &InterpolationContext,
    ) -> Result<Self> {
        let name = interpolation.interpolate(&binding.name);
        if name.is_empty() || name.ends_with('/') {
            return Err(Error::InvalidPipeline(format!(
                "environment '{}' resolves to an empty name",
                binding.name
            )));
        }

        let url = binding
            .url
            .as_deref()
            .map(|u| interpolation.interpolate(u))
            .filter(|u| !u.is_empty());

        let policy = policies.iter().find(|p| p.matches(&name));
        let group_key = policy
            .and_then(|p| p.concurrency_group.clone())
            .unwrap_or_else(|| name.clone());

        Ok(Self {
            protected: policy.is_some_and(|p| p.protected),
            approval: policy.and_then(|p| p.approval.clone()),
            name,
            url,
            group_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn interpolation() -> InterpolationContext {
        let mut vars = HashMap::new();
        vars.insert("TARGET_ENV".to_string(), "dev".to_string());
        vars.insert("CI_COMMIT_REF_SLUG".to_string(), "feature-login".to_string());
        InterpolationContext::with_variables(vars)
    }

    #[test]
    fn test_pattern_matching() {
        let policy = EnvironmentPolicy {
            name: "review/*".into(),
            ..Default::default()
        };
        assert!(policy.matches("review/feature-x"));
        assert!(!policy.matches("production"));
    }

    #[test]
    fn test_resolve_interpolates() {
        let binding = EnvironmentBinding {
            name: "$TARGET_ENV/$CI_COMMIT_REF_SLUG".into(),
            url: Some("https://$CI_COMMIT_REF_SLUG.dev.example.com".into()),
        };
        let env = ResolvedEnvironment::resolve(&binding, &[], &interpolation()).unwrap();
        assert_eq!(env.name, "dev/feature-login");
        assert_eq!(env.url.as_deref(), Some("https://feature-login.dev.example.com"));
        assert!(!env.protected);
        assert_eq!(env.group_key, "dev/feature-login");
    }

    #[test]
    fn test_group_key_from_policy() {
        let policies = vec![EnvironmentPolicy {
            name: "production".into(),
            protected: true,
            concurrency_group: Some("prod-cluster".into()),
            approval: None,
        }];
        let binding = EnvironmentBinding {
            name: "production".into(),
            url: None,
        };
        let env = ResolvedEnvironment::resolve(&binding, &policies, &interpolation()).unwrap();
        assert!(env.protected);
        assert_eq!(env.group_key, "prod-cluster");
    }

    #[test]
    fn test_empty_name_rejected() {
        let binding = EnvironmentBinding {
            name: "$UNSET".into(),
            url: None,
        };
        assert!(ResolvedEnvironment::resolve(&binding, &[], &interpolation()).is_err());
    }
}
