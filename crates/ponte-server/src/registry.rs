// crates/ponte-server/src/registry.rs
// Declarative downstream MCP server registry - re-read on every query

use crate::config::EnvConfig;
use crate::error::{PonteError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Registry files larger than this are rejected outright.
const REGISTRY_SIZE_CAP: u64 = 1024 * 1024; // 1 MiB

/// Launcher definition for one downstream MCP server.
///
/// Built fresh from the registry file on every query; never mutated.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub disabled: bool,
    /// Absolute directories advertised to the server via MCP roots.
    pub roots: Vec<PathBuf>,
}

/// Immutable view of the registry file as read at the start of one query.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub path: PathBuf,
    servers: HashMap<String, DownstreamConfig>,
}

impl ConfigSnapshot {
    /// Identifiers of all enabled downstream servers, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .servers
            .values()
            .filter(|s| !s.disabled)
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Resolve one identifier to its full descriptor.
    pub fn resolve(&self, name: &str) -> Result<&DownstreamConfig> {
        match self.servers.get(name) {
            Some(config) if !config.disabled => Ok(config),
            _ => Err(PonteError::UnknownMcp {
                name: name.to_string(),
                available: self.list(),
            }),
        }
    }
}

/// On-disk schema: top-level `mcpServers` mapping.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, RawServer>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    roots: Vec<PathBuf>,
}

/// Locate the registry file. Search order: explicit env override, the
/// runtime's own config directory, the current working directory, the
/// user's home directory. First existing file wins.
pub fn registry_path(config: &EnvConfig) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(ref override_path) = config.mcp_json_path {
        candidates.push(override_path.clone());
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".lmstudio/mcp.json"));
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join("mcp.json"));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".mcp.json"));
    }

    for candidate in &candidates {
        if candidate.is_file() {
            debug!(path = %candidate.display(), "Using registry file");
            return Ok(candidate.clone());
        }
    }

    Err(PonteError::Registry {
        path: candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
        message: "no registry file found".to_string(),
    })
}

/// Read and parse the registry file for this query. No in-memory copy
/// survives the snapshot; edits to the file are picked up by the next query.
pub fn load_snapshot(config: &EnvConfig) -> Result<ConfigSnapshot> {
    let path = registry_path(config)?;
    load_snapshot_from(&path)
}

/// Parse a specific registry file into a snapshot.
pub fn load_snapshot_from(path: &Path) -> Result<ConfigSnapshot> {
    let registry_err = |message: String| PonteError::Registry {
        path: path.display().to_string(),
        message,
    };

    let metadata =
        std::fs::metadata(path).map_err(|e| registry_err(format!("cannot stat: {}", e)))?;
    if metadata.len() > REGISTRY_SIZE_CAP {
        return Err(registry_err(format!(
            "file is {} bytes, cap is {} bytes",
            metadata.len(),
            REGISTRY_SIZE_CAP
        )));
    }

    let content =
        std::fs::read_to_string(path).map_err(|e| registry_err(format!("cannot read: {}", e)))?;

    let parsed: RegistryFile = serde_json::from_str(&content).map_err(|e| {
        registry_err(format!(
            "parse error at line {} column {}: {}",
            e.line(),
            e.column(),
            e
        ))
    })?;

    let servers = parsed
        .mcp_servers
        .into_iter()
        .map(|(name, raw)| {
            let config = DownstreamConfig {
                name: name.clone(),
                command: raw.command,
                args: raw.args,
                env: raw.env,
                disabled: raw.disabled,
                roots: raw.roots,
            };
            (name, config)
        })
        .collect();

    Ok(ConfigSnapshot {
        path: path.to_path_buf(),
        servers,
    })
}
