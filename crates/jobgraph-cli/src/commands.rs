//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter run definition
    Init {
        /// Where to write the definition
        #[arg(default_value = "jobgraph.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a run definition without running it
    Validate {
        /// Path to the run definition
        #[arg(default_value = "jobgraph.yaml")]
        path: PathBuf,
    },

    /// Show the job instances a definition expands to
    Plan {
        /// Path to the run definition
        #[arg(default_value = "jobgraph.yaml")]
        path: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a run definition locally
    Run(RunArgs),

    /// Print the JSON Schema of the run definition format
    Schema {
        /// Write the schema to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the run definition
    #[arg(default_value = "jobgraph.yaml")]
    pub path: PathBuf,

    /// Event that triggered the run
    #[arg(short, long, value_enum, default_value_t = EventKind::Push)]
    pub event: EventKind,

    /// Branch the run is for
    #[arg(short, long, default_value = "main")]
    pub branch: String,

    /// Tag name, for tag events
    #[arg(long)]
    pub tag: Option<String>,

    /// Target branch, for pull request events
    #[arg(long, default_value = "main")]
    pub base: String,

    /// Pull request number, for pull request events
    #[arg(long, default_value_t = 1)]
    pub pr: u64,

    /// Cron expression, for schedule events
    #[arg(long, default_value = "0 0 * * *")]
    pub cron: String,

    /// Commit SHA
    #[arg(long)]
    pub sha: Option<String>,

    /// Who triggered the run
    #[arg(long)]
    pub actor: Option<String>,

    /// Manual dispatch input (`name=value`), repeatable
    #[arg(short, long = "input", value_name = "NAME=VALUE")]
    pub inputs: Vec<String>,

    /// Extra context value (`key=value`), repeatable; wins over event facts
    #[arg(short, long = "set", value_name = "KEY=VALUE")]
    pub sets: Vec<String>,

    /// Instances allowed to run at once
    #[arg(short = 'j', long)]
    pub max_workers: Option<usize>,

    /// Directory artifact content is kept in
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,

    /// Directory steps run in
    #[arg(short, long, default_value = ".")]
    pub workspace: PathBuf,

    /// Print the run result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventKind {
    Push,
    Tag,
    PullRequest,
    Schedule,
    Manual,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Print the configuration file path
    Path,
}
