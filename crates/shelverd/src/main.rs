//! shelverd — the Shelver daemon binary.
//!
//! Reads `shelver.toml`, then runs the lifecycle state machine, idle
//! watcher, reconciler, audit forwarder, and control API until Ctrl-C.

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use shelver_core::ShelverConfig;

#[derive(Parser)]
#[command(name = "shelverd", about = "Shelver daemon — on-demand GPU instance lifecycle controller")]
struct Cli {
    /// Configuration file (defaults to $SHELVER_CONFIG, then ./shelver.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller (default).
    Run,
    /// Validate the configuration and print it with defaults filled in.
    CheckConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,shelverd=debug,shelver=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = ShelverConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => daemon::run(config).await,
        Command::CheckConfig => {
            print!("{}", config.to_toml_string()?);
            info!(instance = %config.instance.id, "configuration is valid");
            Ok(())
        }
    }
}
