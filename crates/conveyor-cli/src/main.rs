//! Conveyor CLI entrypoint.

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod display;
mod handlers;

use commands::{Commands, ConfigCommands};
use config::CliSettings;
use handlers::RunOptions;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(author, version, about = "Conveyor pipeline runner", long_about = None)]
struct Cli {
    /// Format of diagnostic logs written to stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let settings = CliSettings::load().unwrap_or_default();

    match cli.command {
        Commands::Init { path } => handlers::init(&path)?,
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan { path, context } => handlers::plan(&path, &context, &settings)?,
        Commands::Run {
            path,
            context,
            approve,
            reject,
            approver,
            no_input,
            engine_config,
        } => {
            let options = RunOptions {
                approve,
                reject,
                approver,
                no_input,
                engine_config,
            };
            handlers::run(&path, &context, &settings, options).await?
        }
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&settings)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(())
}
