// crates/ponte-server/src/downstream.rs
// Scoped child-process MCP session: spawn, handshake, list tools, dispatch
// tool calls, shut down cleanly when the scope ends.

use crate::error::{PonteError, Result};
use crate::registry::DownstreamConfig;
use rmcp::model::{
    CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation, ListRootsResult, Root,
    RootsCapabilities,
};
use rmcp::service::{Peer, RequestContext, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::{ClientHandler, ErrorData, RoleClient, serve_client};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Deadline for the MCP initialisation handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for one tools/call round trip.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period for the shutdown sequence before the child is terminated.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// How much captured stderr to embed in handshake failures.
const STDERR_TAIL_BYTES: usize = 4096;

/// Result of one downstream tool call. A server-reported failure keeps the
/// flag set and is still returned to the caller; only transport failures
/// become Rust errors.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub text: String,
    pub is_error: bool,
}

/// Client-side handler for server-initiated requests. Advertises the roots
/// capability only when the descriptor declares filesystem roots.
#[derive(Debug, Clone)]
pub struct PonteClientHandler {
    roots: Vec<Root>,
}

impl PonteClientHandler {
    fn new(config: &DownstreamConfig) -> Self {
        let roots = config
            .roots
            .iter()
            .filter_map(|path| {
                if !path.is_absolute() {
                    warn!(server = %config.name, path = %path.display(), "Ignoring non-absolute root");
                    return None;
                }
                match url::Url::from_file_path(path) {
                    Ok(uri) => Some(Root {
                        uri: uri.to_string(),
                        name: None,
                    }),
                    Err(()) => {
                        warn!(server = %config.name, path = %path.display(), "Root path is not representable as a file URI");
                        None
                    }
                }
            })
            .collect();
        Self { roots }
    }
}

impl ClientHandler for PonteClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities {
                roots: if self.roots.is_empty() {
                    None
                } else {
                    Some(RootsCapabilities::default())
                },
                ..Default::default()
            },
            client_info: Implementation {
                name: "ponte".into(),
                title: Some("Ponte MCP Bridge".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            meta: None,
        }
    }

    async fn list_roots(
        &self,
        _context: RequestContext<RoleClient>,
    ) -> std::result::Result<ListRootsResult, ErrorData> {
        Ok(ListRootsResult {
            roots: self.roots.clone(),
        })
    }
}

/// One connected downstream server. The session exclusively belongs to the
/// enclosing query; `close` must run on every exit path.
#[derive(Debug)]
pub struct DownstreamSession {
    name: String,
    peer: Peer<RoleClient>,
    tools: Vec<rmcp::model::Tool>,
    /// Keeps the transport alive. Dropping this cancels the transport and
    /// kills the child process.
    service: Option<RunningService<RoleClient, PonteClientHandler>>,
    stderr_spool: Option<PathBuf>,
    call_timeout: Duration,
}

impl DownstreamSession {
    /// Spawn the child, perform the MCP handshake, and enumerate tools.
    /// The session is not handed out half-open: any failure here tears the
    /// child down and reports a handshake error with captured stderr.
    pub async fn open(config: &DownstreamConfig) -> Result<Self> {
        let handshake_err = |message: String| PonteError::McpHandshake {
            server: config.name.clone(),
            message,
        };

        let spool = std::env::temp_dir().join(format!(
            "ponte-{}-{}.stderr",
            sanitize(&config.name),
            uuid::Uuid::new_v4()
        ));
        let spool_file = std::fs::File::create(&spool)
            .map_err(|e| handshake_err(format!("cannot create stderr spool: {}", e)))?;

        // Audit log: the registry file decides what gets executed here.
        let env_keys: Vec<&str> = config.env.keys().map(|k| k.as_str()).collect();
        warn!(
            server = %config.name,
            command = %config.command,
            args = ?config.args,
            env_vars = ?env_keys,
            "Spawning MCP server child process from registry"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(spool_file));

        let transport = match TokioChildProcess::new(cmd) {
            Ok(t) => t,
            Err(e) => {
                let _ = std::fs::remove_file(&spool);
                return Err(handshake_err(format!("failed to spawn: {}", e)));
            }
        };

        let handler = PonteClientHandler::new(config);
        let service = match timeout(HANDSHAKE_TIMEOUT, serve_client(handler, transport)).await {
            Ok(Ok(service)) => service,
            Ok(Err(e)) => {
                let detail = stderr_tail(&spool);
                let _ = std::fs::remove_file(&spool);
                return Err(handshake_err(format!(
                    "initialisation failed: {}{}",
                    e, detail
                )));
            }
            Err(_) => {
                let detail = stderr_tail(&spool);
                let _ = std::fs::remove_file(&spool);
                return Err(handshake_err(format!(
                    "initialisation timed out after {}s{}",
                    HANDSHAKE_TIMEOUT.as_secs(),
                    detail
                )));
            }
        };

        let peer = service.peer().clone();

        // The session is ready only once tools/list has succeeded.
        let tools = match timeout(HANDSHAKE_TIMEOUT, peer.list_all_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                let detail = stderr_tail(&spool);
                let session = Self::half_open(config, peer, service, spool);
                session.close().await;
                return Err(handshake_err(format!(
                    "tools/list failed: {}{}",
                    e, detail
                )));
            }
            Err(_) => {
                let detail = stderr_tail(&spool);
                let session = Self::half_open(config, peer, service, spool);
                session.close().await;
                return Err(handshake_err(format!(
                    "tools/list timed out after {}s{}",
                    HANDSHAKE_TIMEOUT.as_secs(),
                    detail
                )));
            }
        };

        info!(
            server = %config.name,
            tool_count = tools.len(),
            roots = config.roots.len(),
            "Connected to MCP server"
        );

        Ok(Self {
            name: config.name.clone(),
            peer,
            tools,
            service: Some(service),
            stderr_spool: Some(spool),
            call_timeout: CALL_TIMEOUT,
        })
    }

    fn half_open(
        config: &DownstreamConfig,
        peer: Peer<RoleClient>,
        service: RunningService<RoleClient, PonteClientHandler>,
        spool: PathBuf,
    ) -> Self {
        Self {
            name: config.name.clone(),
            peer,
            tools: Vec::new(),
            service: Some(service),
            stderr_spool: Some(spool),
            call_timeout: CALL_TIMEOUT,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tools enumerated during the handshake. Valid for this session only.
    pub fn tools(&self) -> &[rmcp::model::Tool] {
        &self.tools
    }

    /// Execute one tool call, bounded by the per-call deadline.
    pub async fn call_tool(&self, tool: &str, args: Map<String, Value>) -> Result<ToolOutcome> {
        debug!(server = %self.name, tool, "Calling MCP tool");

        let call_err = |message: String| PonteError::McpCall {
            server: self.name.clone(),
            message,
        };

        let tool_name: std::borrow::Cow<'static, str> = tool.to_string().into();
        let arguments = if args.is_empty() { None } else { Some(args) };

        let result = timeout(
            self.call_timeout,
            self.peer.call_tool(CallToolRequestParam {
                meta: None,
                name: tool_name,
                arguments,
                task: None,
            }),
        )
        .await
        .map_err(|_| {
            call_err(format!(
                "tool '{}' timed out after {}s",
                tool,
                self.call_timeout.as_secs()
            ))
        })?
        .map_err(|e| call_err(format!("tool '{}': {}", tool, e)))?;

        let text: String = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutcome {
            text: if text.is_empty() {
                "(empty result)".to_string()
            } else {
                text
            },
            is_error: result.is_error.unwrap_or(false),
        })
    }

    /// Send the shutdown sequence and wait up to the grace period before the
    /// child is terminated outright.
    pub async fn close(mut self) {
        if let Some(service) = self.service.take() {
            match timeout(SHUTDOWN_GRACE, service.cancel()).await {
                Ok(Ok(_)) => debug!(server = %self.name, "Downstream session closed"),
                Ok(Err(e)) => {
                    warn!(server = %self.name, error = %e, "Downstream shutdown reported an error")
                }
                Err(_) => warn!(
                    server = %self.name,
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "Downstream shutdown grace elapsed, child terminated"
                ),
            }
        }
        if let Some(spool) = self.stderr_spool.take() {
            let _ = std::fs::remove_file(spool);
        }
    }
}

impl Drop for DownstreamSession {
    fn drop(&mut self) {
        // Dropping `service` (if close was never called) cancels the
        // transport and reaps the child. Only the spool needs manual cleanup.
        if let Some(spool) = self.stderr_spool.take() {
            let _ = std::fs::remove_file(spool);
        }
    }
}

/// Read the tail of the captured stderr stream for failure diagnostics.
fn stderr_tail(spool: &Path) -> String {
    match std::fs::read_to_string(spool) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                String::new()
            } else {
                let tail: String = if trimmed.len() > STDERR_TAIL_BYTES {
                    let start = trimmed.len() - STDERR_TAIL_BYTES;
                    let boundary = trimmed
                        .char_indices()
                        .map(|(i, _)| i)
                        .find(|&i| i >= start)
                        .unwrap_or(start);
                    trimmed[boundary..].to_string()
                } else {
                    trimmed.to_string()
                };
                format!("; stderr: {}", tail)
            }
        }
        Err(_) => String::new(),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn config_with_roots(roots: Vec<PathBuf>) -> DownstreamConfig {
        DownstreamConfig {
            name: "fs".into(),
            command: "mcp-fs".into(),
            args: vec![],
            env: HashMap::new(),
            disabled: false,
            roots,
        }
    }

    #[test]
    fn test_handler_without_roots_has_no_capability() {
        let handler = PonteClientHandler::new(&config_with_roots(vec![]));
        let info = handler.get_info();
        assert!(info.capabilities.roots.is_none());
    }

    #[test]
    fn test_handler_converts_roots_to_file_uris() {
        let handler =
            PonteClientHandler::new(&config_with_roots(vec![PathBuf::from("/srv/data")]));
        let info = handler.get_info();
        assert!(info.capabilities.roots.is_some());
        assert_eq!(handler.roots.len(), 1);
        assert_eq!(handler.roots[0].uri, "file:///srv/data");
    }

    #[test]
    fn test_handler_drops_relative_roots() {
        let handler = PonteClientHandler::new(&config_with_roots(vec![
            PathBuf::from("relative/path"),
            PathBuf::from("/srv/ok"),
        ]));
        assert_eq!(handler.roots.len(), 1);
        assert_eq!(handler.roots[0].uri, "file:///srv/ok");
    }

    #[test]
    fn test_stderr_tail_empty_and_missing() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(stderr_tail(file.path()), "");
        assert_eq!(stderr_tail(Path::new("/nonexistent/spool")), "");
    }

    #[test]
    fn test_stderr_tail_includes_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Error: cannot bind socket").unwrap();
        file.flush().unwrap();
        let tail = stderr_tail(file.path());
        assert!(tail.starts_with("; stderr: "));
        assert!(tail.contains("cannot bind socket"));
    }

    #[test]
    fn test_stderr_tail_bounded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let long_line = "x".repeat(STDERR_TAIL_BYTES * 3);
        write!(file, "{}", long_line).unwrap();
        file.flush().unwrap();
        let tail = stderr_tail(file.path());
        assert!(tail.len() <= STDERR_TAIL_BYTES + 16);
    }

    #[test]
    fn test_sanitize_spool_names() {
        assert_eq!(sanitize("file/system"), "file-system");
        assert_eq!(sanitize("memory"), "memory");
    }
}
