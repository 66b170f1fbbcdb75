use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "scalegrid",
    about = "scalegrid — service registry, load balancing and autoscaling",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a config file, then summarize it
    Check {
        /// Path to scalegrid.toml
        #[arg(short, long, default_value = "scalegrid.toml")]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print the default configuration as TOML
    Defaults,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,scalegrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config, format } => commands::check(&config, &format),
        Commands::Defaults => commands::defaults(),
    }
}
