// crates/ponte-server/src/cli/serve.rs
// MCP server initialization and main loop

use anyhow::{Result, bail};
use ponte::autonomous::Engine;
use ponte::config::EnvConfig;
use ponte::lifecycle::ModelLifecycle;
use ponte::llm::LmStudioClient;
use ponte::mcp::PonteServer;
use ponte::registry;
use std::sync::Arc;
use tracing::{info, warn};

/// Build the bridge server from environment configuration. Shared by
/// `run_mcp_server` and the direct tool runner.
pub fn build_server() -> Result<PonteServer> {
    let env_config = EnvConfig::load();

    let validation = env_config.validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid() {
        // Startup misconfiguration is the one case that exits non-zero.
        bail!("invalid configuration:\n{}", validation.report());
    }

    let runtime = Arc::new(LmStudioClient::from_env(&env_config));
    let lifecycle = Arc::new(ModelLifecycle::new(runtime.clone()));
    let engine = Arc::new(Engine::new(env_config, runtime.clone(), lifecycle));

    Ok(PonteServer::new(engine, runtime))
}

/// Run the MCP server with stdio transport
pub async fn run_mcp_server() -> Result<()> {
    let server = build_server()?;

    info!(
        runtime = server.runtime.base_url(),
        "Ponte MCP server starting on stdio"
    );

    match registry::load_snapshot(server.engine.env()) {
        Ok(snapshot) => info!(
            registry = %snapshot.path.display(),
            enabled = ?snapshot.list(),
            "Registry found"
        ),
        // Not fatal at startup: the file is re-read per query and may appear later.
        Err(e) => warn!("{}", e),
    }

    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(server, transport).await?;
    service.waiting().await?;

    Ok(())
}

/// Print enabled registry identifiers, one per line (shell-friendly).
pub fn run_mcps() -> Result<()> {
    let env_config = EnvConfig::load();
    let snapshot = registry::load_snapshot(&env_config)
        .map_err(|e| anyhow::anyhow!(e.to_user_string()))?;
    for name in snapshot.list() {
        println!("{}", name);
    }
    Ok(())
}
