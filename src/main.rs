use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use docusuite::commands;
use docusuite::config::Config;

#[derive(Parser)]
#[command(name = "docusuite")]
#[command(version)]
#[command(about = "Ask questions about your contracts, answered from their own text", long_about = None)]
struct Cli {
    /// Use this config file instead of ~/.docusuite/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Address to listen on
        #[arg(long, env = "DOCUSUITE_BIND")]
        bind: Option<String>,
    },
    /// Chat about an uploaded document
    Chat {
        /// Document the answers are grounded on
        #[arg(long)]
        chat_id: String,
        /// Base URL of a running server
        #[arg(long, env = "DOCUSUITE_ENDPOINT")]
        endpoint: Option<String>,
        /// Contract text to extract obligations from, for /explain
        #[arg(long)]
        contract: Option<PathBuf>,
    },
    /// Stream a plain-language summary of a contract
    Summarize {
        file: PathBuf,
        #[arg(long, env = "DOCUSUITE_ENDPOINT")]
        endpoint: Option<String>,
    },
    /// List the obligations of each party in a contract
    Obligations {
        file: PathBuf,
        #[arg(long, env = "DOCUSUITE_ENDPOINT")]
        endpoint: Option<String>,
    },
    /// Show the configuration, or write a default one
    Config {
        #[arg(long)]
        init: bool,
    },
}

fn init_tracing(command: &Commands) {
    // Interactive commands keep the terminal for the conversation
    let default_filter = match command {
        Commands::Serve { .. } => "info,docusuite=debug",
        _ => "warn",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Serve { bind } => commands::serve(&config, bind).await,
        Commands::Chat {
            chat_id,
            endpoint,
            contract,
        } => commands::chat(&config, endpoint, &chat_id, contract.as_deref()).await,
        Commands::Summarize { file, endpoint } => commands::summarize(&config, endpoint, &file).await,
        Commands::Obligations { file, endpoint } => {
            commands::obligations(&config, endpoint, &file).await
        }
        Commands::Config { init } => commands::config(&config, init),
    }
}
