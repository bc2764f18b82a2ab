//! CLI command definitions.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter pipeline definition
    Init {
        #[arg(default_value = "conveyor.yaml")]
        path: PathBuf,
    },

    /// Validate a pipeline definition
    Validate {
        #[arg(default_value = "conveyor.yaml")]
        path: PathBuf,
    },

    /// Show which jobs would run for a commit, and where they deploy
    Plan {
        #[arg(default_value = "conveyor.yaml")]
        path: PathBuf,

        #[command(flatten)]
        context: ContextArgs,
    },

    /// Run a pipeline locally
    Run {
        #[arg(default_value = "conveyor.yaml")]
        path: PathBuf,

        #[command(flatten)]
        context: ContextArgs,

        /// Approve the gate of this manual job when it is reached (repeatable)
        #[arg(long = "approve", value_name = "JOB")]
        approve: Vec<String>,

        /// Reject the gate of this manual job when it is reached (repeatable)
        #[arg(long = "reject", value_name = "JOB")]
        reject: Vec<String>,

        /// Identity that approves or rejects gates, defaults to the OS user
        #[arg(long, env = "CONVEYOR_APPROVER", value_name = "NAME")]
        approver: Option<String>,

        /// Never prompt for approvals
        #[arg(long)]
        no_input: bool,

        /// Engine configuration file (YAML)
        #[arg(long, value_name = "FILE")]
        engine_config: Option<PathBuf>,
    },

    /// Print the JSON schema of pipeline definitions
    Schema,

    /// Manage CLI settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// The commit a run is triggered for.
#[derive(Args, Debug, Clone)]
pub struct ContextArgs {
    /// Branch to build
    #[arg(short, long, conflicts_with = "tag", required_unless_present = "tag")]
    pub branch: Option<String>,

    /// Tag to build
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Commit SHA
    #[arg(long, env = "CI_COMMIT_SHA", default_value = "0000000000000000000000000000000000000000")]
    pub sha: String,

    /// Project path, defaults to the configured project or the directory name
    #[arg(long)]
    pub project: Option<String>,

    /// Who triggers the run
    #[arg(long, env = "CONVEYOR_ACTOR")]
    pub actor: Option<String>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current settings
    Show,

    /// Set a setting
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_run_approver_is_separate_from_actor() {
        let cli = TestCli::parse_from(["conveyor", "run", "--tag", "1.2.3", "--approver", "ops-lead"]);
        let Commands::Run { context, approver, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(context.tag.as_deref(), Some("1.2.3"));
        assert_eq!(approver.as_deref(), Some("ops-lead"));
        assert_eq!(context.actor, None);
    }
}
