// crates/ponte-server/src/cli/mod.rs
// CLI module for Ponte commands

use clap::{Parser, Subcommand};

pub mod serve;
pub mod tool;

pub use serve::{run_mcp_server, run_mcps};
pub use tool::run_tool;

#[derive(Parser)]
#[command(name = "ponte")]
#[command(about = "MCP bridge for local LLM runtimes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as MCP server over stdio (default)
    Serve,

    /// Execute a bridge tool directly
    Tool {
        /// Tool name (e.g. autonomous_with_mcp, list_available_mcps)
        #[arg(index = 1)]
        name: String,

        /// JSON arguments (e.g. '{"mcp_name": "filesystem", "task": "list /tmp"}')
        #[arg(index = 2, default_value = "{}")]
        args: String,
    },

    /// List enabled downstream MCP servers from the registry
    Mcps,
}
