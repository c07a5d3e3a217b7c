// crates/ponte-server/src/mcp/mod.rs
// North-side MCP server: the bridge tools exposed to the MCP client

mod handler;

use crate::autonomous::{AutonomousRequest, Engine, ROUND_CEILING};
use crate::llm::{LmStudioClient, ModelRuntime};
use crate::registry;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    schemars, tool, tool_router,
};
use serde::Deserialize;
use std::sync::Arc;

/// MCP server state. Cloned per request by rmcp; everything heavy sits
/// behind Arcs.
#[derive(Clone)]
pub struct PonteServer {
    pub engine: Arc<Engine>,
    /// Concrete runtime client for status reporting (health + listing).
    pub runtime: Arc<LmStudioClient>,
    tool_router: ToolRouter<Self>,
}

impl PonteServer {
    pub fn new(engine: Arc<Engine>, runtime: Arc<LmStudioClient>) -> Self {
        Self {
            engine,
            runtime,
            tool_router: Self::tool_router(),
        }
    }
}

/// Per-round output token cap: a count, or "auto" to let the runtime decide.
#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum MaxTokens {
    Count(u32),
    Mode(String),
}

impl MaxTokens {
    pub fn resolve(&self) -> Option<u32> {
        match self {
            MaxTokens::Count(n) => Some(*n),
            MaxTokens::Mode(_) => None,
        }
    }
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AutonomousWithMcpRequest {
    #[schemars(description = "Registry identifier of the downstream MCP server to drive")]
    pub mcp_name: String,
    #[schemars(description = "Task for the model to complete autonomously")]
    pub task: String,
    #[schemars(description = "Model identifier. Omit or pass 'default' for the runtime default")]
    pub model: Option<String>,
    #[schemars(description = "Safety ceiling on dialogue rounds (default 10000)")]
    pub max_rounds: Option<u32>,
    #[schemars(description = "Per-round output token cap, or \"auto\"")]
    pub max_tokens: Option<MaxTokens>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AutonomousWithMultipleMcpsRequest {
    #[schemars(description = "Registry identifiers of the downstream MCP servers to compose")]
    pub mcp_names: Vec<String>,
    #[schemars(description = "Task for the model to complete autonomously")]
    pub task: String,
    #[schemars(description = "Model identifier. Omit or pass 'default' for the runtime default")]
    pub model: Option<String>,
    #[schemars(description = "Safety ceiling on dialogue rounds (default 10000)")]
    pub max_rounds: Option<u32>,
    #[schemars(description = "Per-round output token cap, or \"auto\"")]
    pub max_tokens: Option<MaxTokens>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AutonomousDiscoverRequest {
    #[schemars(description = "Task for the model to complete autonomously")]
    pub task: String,
    #[schemars(description = "Model identifier. Omit or pass 'default' for the runtime default")]
    pub model: Option<String>,
    #[schemars(description = "Safety ceiling on dialogue rounds (default 10000)")]
    pub max_rounds: Option<u32>,
    #[schemars(description = "Per-round output token cap, or \"auto\"")]
    pub max_tokens: Option<MaxTokens>,
}

fn build_request(
    task: String,
    downstreams: Vec<String>,
    model: Option<String>,
    max_rounds: Option<u32>,
    max_tokens: Option<MaxTokens>,
) -> AutonomousRequest {
    AutonomousRequest {
        task,
        downstreams,
        model,
        max_rounds: max_rounds.unwrap_or(ROUND_CEILING),
        max_tokens: max_tokens.and_then(|t| t.resolve()),
    }
}

#[tool_router]
impl PonteServer {
    #[tool(
        description = "Run a task autonomously: the local model drives one downstream MCP server's tools until it has an answer."
    )]
    async fn autonomous_with_mcp(
        &self,
        Parameters(req): Parameters<AutonomousWithMcpRequest>,
    ) -> Result<String, String> {
        let request = build_request(
            req.task,
            vec![req.mcp_name],
            req.model,
            req.max_rounds,
            req.max_tokens,
        );
        self.engine
            .execute(request)
            .await
            .map_err(|e| e.to_user_string())
    }

    #[tool(
        description = "Run a task autonomously against several downstream MCP servers at once. Conflicting tool names are qualified as <server>.<tool>."
    )]
    async fn autonomous_with_multiple_mcps(
        &self,
        Parameters(req): Parameters<AutonomousWithMultipleMcpsRequest>,
    ) -> Result<String, String> {
        if req.mcp_names.is_empty() {
            return Err("UnknownMCPError: mcp_names must name at least one server".to_string());
        }
        let request = build_request(
            req.task,
            req.mcp_names,
            req.model,
            req.max_rounds,
            req.max_tokens,
        );
        self.engine
            .execute(request)
            .await
            .map_err(|e| e.to_user_string())
    }

    #[tool(
        description = "Run a task autonomously against every enabled server in the registry (auto-discover mode)."
    )]
    async fn autonomous_discover_and_execute(
        &self,
        Parameters(req): Parameters<AutonomousDiscoverRequest>,
    ) -> Result<String, String> {
        let request = build_request(req.task, Vec::new(), req.model, req.max_rounds, req.max_tokens);
        self.engine
            .execute(request)
            .await
            .map_err(|e| e.to_user_string())
    }

    #[tool(description = "List the registry identifiers of all enabled downstream MCP servers.")]
    async fn list_available_mcps(&self) -> Result<String, String> {
        let names = self.engine.list_mcps().map_err(|e| e.to_user_string())?;
        serde_json::to_string(&names).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Report bridge health: runtime reachability, resident models with status, and the active registry."
    )]
    async fn bridge_status(&self) -> Result<String, String> {
        let mut lines = vec![format!(
            "Ponte {} at {}",
            env!("CARGO_PKG_VERSION"),
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )];

        match self.runtime.health().await {
            Ok(()) => lines.push(format!("Runtime: reachable at {}", self.runtime.base_url())),
            Err(e) => lines.push(format!(
                "Runtime: UNREACHABLE at {} ({})",
                self.runtime.base_url(),
                e
            )),
        }

        match self.runtime.list_models().await {
            Ok(models) if models.is_empty() => lines.push("Models: none resident".to_string()),
            Ok(models) => {
                lines.push("Models:".to_string());
                for model in models {
                    lines.push(format!("  {} ({})", model.id, model.status));
                }
            }
            Err(e) => lines.push(format!("Models: listing failed ({})", e)),
        }

        match registry::load_snapshot(self.engine.env()) {
            Ok(snapshot) => {
                lines.push(format!("Registry: {}", snapshot.path.display()));
                let names = snapshot.list();
                if names.is_empty() {
                    lines.push("  no enabled servers".to_string());
                } else {
                    lines.push(format!("  enabled: {}", names.join(", ")));
                }
            }
            Err(e) => lines.push(format!("Registry: {}", e)),
        }

        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_tokens_resolution() {
        let count: MaxTokens = serde_json::from_str("4096").unwrap();
        assert_eq!(count.resolve(), Some(4096));

        let auto: MaxTokens = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto.resolve(), None);
    }

    #[test]
    fn test_build_request_defaults() {
        let request = build_request("task".into(), vec!["fs".into()], None, None, None);
        assert_eq!(request.max_rounds, ROUND_CEILING);
        assert_eq!(request.max_tokens, None);

        let request = build_request(
            "task".into(),
            vec![],
            Some("qwen".into()),
            Some(3),
            Some(MaxTokens::Count(512)),
        );
        assert_eq!(request.max_rounds, 3);
        assert_eq!(request.max_tokens, Some(512));
    }

    #[test]
    fn test_request_deserialization() {
        let req: AutonomousWithMcpRequest = serde_json::from_str(
            r#"{"mcp_name": "filesystem", "task": "list /tmp", "max_rounds": 5, "max_tokens": "auto"}"#,
        )
        .unwrap();
        assert_eq!(req.mcp_name, "filesystem");
        assert_eq!(req.max_rounds, Some(5));
        assert!(matches!(req.max_tokens, Some(MaxTokens::Mode(_))));
    }
}
