//! Runtime configuration.

use conveyor_core::context::slugify;
use conveyor_core::pipeline::CacheSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which runtime executes jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Docker for jobs with an image, the host shell otherwise.
    #[default]
    Auto,
    Shell,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub kind: RuntimeKind,
    /// Interpreter used for job scripts.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Pass the host environment through to shell jobs.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Image for container jobs that do not name one.
    #[serde(default = "default_image")]
    pub default_image: String,
    /// Pull images that are missing locally.
    #[serde(default = "default_true")]
    pub pull_images: bool,
    /// Root of per-key cache directories.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_true() -> bool {
    true
}

fn default_image() -> String {
    "alpine:3.20".to_string()
}

fn default_cache_root() -> PathBuf {
    std::env::temp_dir().join("conveyor-cache")
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            shell: default_shell(),
            inherit_env: true,
            default_image: default_image(),
            pull_images: true,
            cache_root: default_cache_root(),
        }
    }
}

impl RunnerConfig {
    /// Cache directory shared by jobs with the same cache key.
    pub fn cache_dir(&self, cache: &CacheSpec, job: &str) -> PathBuf {
        let key = cache.key.as_deref().unwrap_or(job);
        self.cache_root.join(slugify(key))
    }
}
