//! aibalance CLI
//!
//! Runs the balancer and manages the providers stored in its database.

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod output;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json {
        colored::control::set_override(false);
    }
    cli.execute().await
}
