use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use assistant_gateway::config::GatewayConfig;
use assistant_gateway::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "assistant-gateway")]
#[command(version, about = "Chat gateway for stream-json assistant processes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file. Defaults to ./gateway.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the WebSocket and REST gateway
    Serve {
        /// Port to serve on (overrides config and PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config and HOST)
        #[arg(long)]
        host: Option<String>,
    },
    /// Run a single turn and print its events as JSON lines
    Ask {
        message: String,

        /// Conversation id (generated when omitted)
        #[arg(long)]
        conversation: Option<String>,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Session token to resume
        #[arg(long)]
        resume: Option<String>,

        /// Attachment name inside the upload directory (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = GatewayConfig::load(cli.config.as_deref())?;
    logging::init(&config.logging, cli.verbose);

    match cli.command {
        Commands::Serve { port, host } => cmd::cmd_serve(config, port, host).await?,
        Commands::Ask {
            message,
            conversation,
            model,
            resume,
            files,
        } => {
            let args = cmd::AskArgs {
                message,
                conversation,
                model,
                resume,
                files,
            };
            cmd::cmd_ask(config, args).await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, cli.config.as_deref(), command)?,
    }

    Ok(())
}
