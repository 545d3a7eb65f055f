//! SPF CLI - Command-line interface for the SPF container runtime.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spf")]
#[command(author, version, about = "SPF container runtime CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute inter-container buffering for a producer/consumer pair
    Icb(commands::icb::IcbArgs),

    /// Load a graph description and drive it through PREPARE/START/STOP
    Run(commands::run::RunArgs),

    /// Dump the real-time monitoring packets of a prepared graph as JSON
    Rtm(commands::rtm::RtmArgs),
}

fn main() -> anyhow::Result<()> {
    // stderr keeps stdout clean for JSON output
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    tracing_log::LogTracer::init().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Icb(args) => commands::icb::run(args),
        Commands::Run(args) => commands::run::run(args),
        Commands::Rtm(args) => commands::rtm::run(args),
    }
}
