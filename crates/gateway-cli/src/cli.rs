//! CLI argument definitions using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands;

/// LLM Balance Gateway - failover load balancer for chat completions
#[derive(Parser, Debug)]
#[command(name = "aibalance")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase output verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file path
    #[arg(short, long, env = "BALANCER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the balancer
    #[command(visible_alias = "start")]
    Serve(commands::serve::ServeArgs),

    /// Add an upstream provider to the database
    #[command(name = "register-provider")]
    RegisterProvider(commands::providers::RegisterProviderArgs),

    /// List providers stored in the database
    #[command(name = "list-providers")]
    ListProviders(commands::providers::ListProvidersArgs),

    /// Check a configuration file and summarize it
    Validate,
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = self.config.as_deref();
        match self.command {
            Commands::Serve(args) => commands::serve::execute(args, config, self.verbose).await,
            Commands::RegisterProvider(args) => {
                commands::providers::execute_register(args, config, self.json).await
            }
            Commands::ListProviders(args) => {
                commands::providers::execute_list(args, config, self.json).await
            }
            Commands::Validate => commands::validate::execute(config, self.json).await,
        }
    }
}
