mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "jarvis")]
#[command(about = "Multi-agent coordination substrate", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lights / calendar / notify scenario on an in-process network
    Demo {
        /// Run the steps one after another instead of as a dependency graph
        #[arg(long)]
        sequential: bool,

        /// Make the calendar agent fail to show error propagation
        #[arg(long)]
        fail_calendar: bool,
    },

    /// Show configuration and resilience settings
    Status,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the JSON Schema of the config file
    Schema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Demo {
            sequential,
            fail_calendar,
        } => {
            commands::demo::run(sequential, fail_calendar).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config_cmd::show().await?,
            ConfigCommands::Path => commands::config_cmd::path().await?,
            ConfigCommands::Init { force } => commands::config_cmd::init(force).await?,
            ConfigCommands::Schema => commands::config_cmd::schema().await?,
        },
    }

    Ok(())
}
