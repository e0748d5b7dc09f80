use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod config;
mod serve;
mod status;

#[derive(Parser, Debug)]
#[command(name = "coordd")]
#[command(about = "Outbox/inbox dispatch, scheduling, and fanout coordination daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatcher, scheduler, and fanout loops until shutdown.
    Serve,

    /// Print a per-store WorkQueue snapshot as JSON.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::CoordConfig::from_env().context("load coordd config")?;

    match cli.command {
        Command::Serve => serve::run(&cfg).await,
        Command::Status => status::run(&cfg).await,
    }
}
