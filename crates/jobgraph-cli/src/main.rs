//! jobgraph CLI entrypoint.

use clap::Parser;
use jobgraph_core::run::RunStatus;
use jobgraph_trace::{TracingConfig, init_tracing};
use std::process::ExitCode;

mod commands;
mod config;
mod handlers;
mod reporter;

use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "jobgraph")]
#[command(author, version, about = "Run job graphs locally", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();

    init_tracing(&TracingConfig {
        default_filter: if cli.verbose { "debug" } else { "warn" }.to_string(),
        format: config.log_format,
        ..TracingConfig::default()
    })?;

    match cli.command {
        Commands::Init { path, force } => handlers::init(&path, force)?,
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan { path, json } => handlers::plan(&path, json)?,
        Commands::Run(args) => {
            return Ok(match handlers::run(&config, args).await? {
                RunStatus::Succeeded => ExitCode::SUCCESS,
                RunStatus::Failed => ExitCode::from(1),
                RunStatus::Cancelled => ExitCode::from(130),
            });
        }
        Commands::Schema { output } => handlers::schema(output.as_deref())?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
            ConfigCommands::Path => handlers::config_path()?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
