mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use labrunner_common::config::{EngineConfig, SandboxConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "labrunner-cli")]
#[command(about = "labrunner CLI - Run submissions and manage module images locally", long_about = None)]
struct Cli {
    /// Print engine logs to stderr
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a file as the submission for a module
    Run {
        /// Module id (e.g., module-1)
        #[arg(short, long)]
        module: String,

        /// File holding the submission
        #[arg(short, long)]
        file: PathBuf,

        /// Skip the container engine even if it is reachable
        #[arg(long, default_value = "false")]
        no_docker: bool,
    },

    /// Run a module's tests against a submission
    Test {
        /// Module id (e.g., module-3)
        #[arg(short, long)]
        module: String,

        /// File holding the submission
        #[arg(short, long)]
        file: PathBuf,

        /// Skip the container engine even if it is reachable
        #[arg(long, default_value = "false")]
        no_docker: bool,
    },

    /// Write the build context archive of a module to disk
    Context {
        /// Module id
        #[arg(short, long)]
        module: String,

        /// Output archive path
        #[arg(short, long, default_value = "context.tar")]
        output: PathBuf,
    },

    /// Build the container image for a module
    BuildImage {
        /// Module id
        #[arg(short, long)]
        module: String,

        /// Build the test image instead of the run image
        #[arg(long, default_value = "false")]
        test: bool,
    },

    /// List available modules
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let engine = EngineConfig::from_env();
    let sandbox = SandboxConfig::from_env();

    match cli.command {
        Commands::Run {
            module,
            file,
            no_docker,
        } => {
            commands::run_submission(engine, sandbox, &module, &file, no_docker).await?;
        }
        Commands::Test {
            module,
            file,
            no_docker,
        } => {
            commands::test_submission(engine, sandbox, &module, &file, no_docker).await?;
        }
        Commands::Context { module, output } => {
            commands::write_context(&engine, &module, &output)?;
        }
        Commands::BuildImage { module, test } => {
            commands::build_image(engine, sandbox, &module, test).await?;
        }
        Commands::List => {
            commands::list_modules(&engine)?;
        }
    }

    Ok(())
}
