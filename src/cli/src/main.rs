//! RedQueue CLI - Command-line interface for RedQueue streams.
//!
//! Provides commands for sending messages, inspecting streams and consumer
//! groups, reading dead-letter streams, checking crontabs and validating
//! configuration.

mod commands;
mod connection;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, crontab, dlq, send, stream};
use output::OutputFormat;

/// RedQueue - Reliable work queues on Redis Streams
#[derive(Parser)]
#[command(
    name = "redqueue",
    version,
    about = "RedQueue - Reliable work queues on Redis Streams",
    long_about = "CLI tool for sending messages, inspecting streams, consumer groups and dead-letter streams, and checking crontabs.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Redis connection URL
    #[arg(long, global = true, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a message to a stream
    Send(send::SendArgs),

    /// Stream and consumer group inspection
    #[command(subcommand)]
    Stream(stream::StreamCommands),

    /// Dead-letter stream operations
    #[command(subcommand)]
    Dlq(dlq::DlqCommands),

    /// Crontab inspection
    #[command(subcommand)]
    Crontab(crontab::CrontabCommands),

    /// Configuration validation
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let url = connection::resolve_url(cli.redis_url.as_deref());
    let format = cli.output;

    let result = match cli.command {
        Commands::Send(args) => send::execute(args, &url, format).await,
        Commands::Stream(cmd) => stream::execute(cmd, &url, format).await,
        Commands::Dlq(cmd) => dlq::execute(cmd, &url, format).await,
        Commands::Crontab(cmd) => crontab::execute(cmd, &url, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
