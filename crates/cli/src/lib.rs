pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "insureflow",
    about = "Insureflow operator CLI",
    long_about = "Inspect configuration and flow definitions, apply migrations, and check runtime readiness.",
    after_help = "Examples:\n  insureflow doctor --json\n  insureflow flows --path config/flows.toml\n  insureflow migrate --status"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Load and validate the flow registry, then summarize every flow")]
    Flows {
        #[arg(long, help = "Validate this flow file instead of the configured registry")]
        path: Option<PathBuf>,
    },
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate {
        #[arg(long, help = "List pending migration versions without applying them")]
        status: bool,
    },
    #[command(about = "Validate config, flow registry, integrations and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Flows { path } => commands::flows::run(path.as_deref()),
        Command::Migrate { status } => commands::migrate::run(status),
        Command::Doctor { json } => commands::doctor::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
