// crates/ponte-server/src/cli/tool.rs
// Direct tool execution from the shell, without an MCP client

use super::serve::build_server;
use anyhow::{Context, Result, bail};
use ponte::autonomous::{AutonomousRequest, ROUND_CEILING};
use ponte::mcp::{
    AutonomousDiscoverRequest, AutonomousWithMcpRequest, AutonomousWithMultipleMcpsRequest,
    MaxTokens,
};

fn rounds(max_rounds: Option<u32>) -> u32 {
    max_rounds.unwrap_or(ROUND_CEILING)
}

fn tokens(max_tokens: Option<MaxTokens>) -> Option<u32> {
    max_tokens.and_then(|t| t.resolve())
}

/// Execute one bridge tool by name with JSON arguments and print the result.
/// In-query failures are printed as tool results, exactly as an MCP client
/// would see them; only bad invocations exit non-zero.
pub async fn run_tool(name: String, args: String) -> Result<()> {
    let server = build_server()?;
    let parsed: serde_json::Value =
        serde_json::from_str(&args).context("arguments must be a JSON object")?;

    let output = match name.as_str() {
        "autonomous_with_mcp" => {
            let req: AutonomousWithMcpRequest = serde_json::from_value(parsed)?;
            let request = AutonomousRequest {
                task: req.task,
                downstreams: vec![req.mcp_name],
                model: req.model,
                max_rounds: rounds(req.max_rounds),
                max_tokens: tokens(req.max_tokens),
            };
            server
                .engine
                .execute(request)
                .await
                .unwrap_or_else(|e| e.to_user_string())
        }
        "autonomous_with_multiple_mcps" => {
            let req: AutonomousWithMultipleMcpsRequest = serde_json::from_value(parsed)?;
            let request = AutonomousRequest {
                task: req.task,
                downstreams: req.mcp_names,
                model: req.model,
                max_rounds: rounds(req.max_rounds),
                max_tokens: tokens(req.max_tokens),
            };
            server
                .engine
                .execute(request)
                .await
                .unwrap_or_else(|e| e.to_user_string())
        }
        "autonomous_discover_and_execute" => {
            let req: AutonomousDiscoverRequest = serde_json::from_value(parsed)?;
            let request = AutonomousRequest {
                task: req.task,
                downstreams: Vec::new(),
                model: req.model,
                max_rounds: rounds(req.max_rounds),
                max_tokens: tokens(req.max_tokens),
            };
            server
                .engine
                .execute(request)
                .await
                .unwrap_or_else(|e| e.to_user_string())
        }
        "list_available_mcps" => match server.engine.list_mcps() {
            Ok(names) => serde_json::to_string(&names)?,
            Err(e) => e.to_user_string(),
        },
        other => bail!(
            "unknown tool '{}'. Available: autonomous_with_mcp, \
             autonomous_with_multiple_mcps, autonomous_discover_and_execute, \
             list_available_mcps",
            other
        ),
    };

    println!("{}", output);
    Ok(())
}
