// crates/ponte-server/src/main.rs
// Ponte - MCP bridge for local LLM runtimes

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.ponte/.env only (never from CWD — a hostile repo
    // could redirect the bridge at a different runtime)
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".ponte/.env"))
    {
        tracing::debug!("Failed to load global .env file: {}", e);
    }

    let cli = Cli::parse();

    // stdout is the MCP wire in serve mode; all logging goes to stderr.
    let default_level = match &cli.command {
        Some(Commands::Serve) | None => Level::WARN,
        Some(Commands::Tool { .. }) => Level::INFO,
        Some(Commands::Mcps) => Level::WARN,
    };
    let log_level = std::env::var("PONTE_LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(default_level);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        None | Some(Commands::Serve) => {
            cli::run_mcp_server().await?;
        }
        Some(Commands::Tool { name, args }) => {
            cli::run_tool(name, args).await?;
        }
        Some(Commands::Mcps) => {
            cli::run_mcps()?;
        }
    }

    Ok(())
}
