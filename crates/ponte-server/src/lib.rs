// crates/ponte-server/src/lib.rs
// Ponte - MCP bridge for local LLM runtimes

#![allow(clippy::collapsible_if)]
#![allow(clippy::too_many_arguments)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod autonomous;
pub mod config;
pub mod downstream;
pub mod error;
pub mod formatter;
pub mod lifecycle;
pub mod llm;
pub mod mcp;
pub mod registry;
pub mod schema;
pub use error::{PonteError, Result};
