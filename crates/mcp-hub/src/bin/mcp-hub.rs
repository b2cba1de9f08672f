//! CLI entry point: a single `serve` subcommand, the minimum wiring needed
//! for this crate to be a runnable program rather than a CLI product in
//! its own right.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mcp_hub::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "mcp-hub", version, about = "MCP aggregating hub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the hub process: connect to configured backends and serve the
    /// aggregated virtual MCP server.
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => mcp_hub::serve::run(args).await,
    }
}
