// crates/ponte-server/src/autonomous/mod.rs
// The autonomous execution engine: resolve downstream servers, ensure the
// model is active, open scoped MCP sessions, and drive the bounded
// tool-calling dialogue until the LLM produces a terminal answer.

use crate::config::EnvConfig;
use crate::downstream::{DownstreamSession, ToolOutcome};
use crate::error::{PonteError, Result};
use crate::formatter;
use crate::lifecycle::{DEFAULT_MODEL_TTL_SECS, ModelLifecycle};
use crate::llm::{LlmTransport, RespondRequest, ToolChoice};
use crate::registry::{self, DownstreamConfig};
use crate::schema::{self, ToolCatalogue};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Safety ceiling on dialogue rounds. The intended behaviour is "run until
/// the LLM produces a terminal answer or the caller cancels"; this bound
/// exists so a looping LLM is always stoppable. Do not shrink it.
pub const ROUND_CEILING: u32 = 10_000;

/// Sentinel prefix returned when the round budget runs out without a
/// terminal answer.
pub const EXHAUSTED_MARKER: &str = "[max-rounds-exhausted]";

/// Appended to injected tool results so the model treats them as the new turn.
const CONTINUATION_PROMPT: &str = "Continue the task using these tool results.";

/// One autonomous invocation.
#[derive(Debug, Clone)]
pub struct AutonomousRequest {
    pub task: String,
    /// Registry identifiers to drive. Empty means discover mode: the whole
    /// enabled registry.
    pub downstreams: Vec<String>,
    pub model: Option<String>,
    pub max_rounds: u32,
    /// Soft per-round output cap advisory to the LLM. None means "auto".
    pub max_tokens: Option<u32>,
}

impl AutonomousRequest {
    pub fn new(task: impl Into<String>, downstreams: Vec<String>) -> Self {
        Self {
            task: task.into(),
            downstreams,
            model: None,
            max_rounds: ROUND_CEILING,
            max_tokens: None,
        }
    }
}

/// Seam between the dialogue and the downstream sessions, so the loop can be
/// exercised against scripted dispatchers in tests.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    fn catalogue(&self) -> &ToolCatalogue;

    async fn dispatch(
        &self,
        server: &str,
        tool: &str,
        args: Map<String, Value>,
    ) -> Result<ToolOutcome>;
}

/// The set of downstream sessions owned by one query, plus the merged tool
/// catalogue. Sessions open together and close together.
#[derive(Debug)]
pub struct SessionSet {
    sessions: Vec<DownstreamSession>,
    catalogue: ToolCatalogue,
}

impl SessionSet {
    /// Open one session per descriptor, in order. If any open fails, the
    /// sessions already opened are closed before the error propagates - the
    /// caller never holds a partially-opened set.
    pub async fn open(configs: &[DownstreamConfig]) -> Result<Self> {
        let mut sessions: Vec<DownstreamSession> = Vec::with_capacity(configs.len());

        for config in configs {
            match DownstreamSession::open(config).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    for session in sessions {
                        session.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let per_server: Vec<(String, Vec<crate::llm::LlmTool>)> = sessions
            .iter()
            .map(|s| {
                (
                    s.name().to_string(),
                    s.tools().iter().map(schema::from_mcp_tool).collect(),
                )
            })
            .collect();
        let catalogue = ToolCatalogue::build(&per_server);

        info!(
            sessions = sessions.len(),
            tools = catalogue.len(),
            "Downstream sessions ready"
        );

        Ok(Self {
            sessions,
            catalogue,
        })
    }

    pub async fn close_all(self) {
        futures::future::join_all(self.sessions.into_iter().map(|s| s.close())).await;
    }
}

#[async_trait]
impl ToolDispatcher for SessionSet {
    fn catalogue(&self) -> &ToolCatalogue {
        &self.catalogue
    }

    async fn dispatch(
        &self,
        server: &str,
        tool: &str,
        args: Map<String, Value>,
    ) -> Result<ToolOutcome> {
        let session = self
            .sessions
            .iter()
            .find(|s| s.name() == server)
            .ok_or_else(|| PonteError::McpCall {
                server: server.to_string(),
                message: "session not open".to_string(),
            })?;
        session.call_tool(tool, args).await
    }
}

/// Per-round trace, logged at debug level and retained only for the duration
/// of the invocation.
struct RoundRecord {
    round: u32,
    kind: &'static str,
    tool_calls: usize,
    elapsed_ms: u64,
    response_id: String,
}

impl RoundRecord {
    fn log(&self) {
        debug!(
            round = self.round,
            kind = self.kind,
            tool_calls = self.tool_calls,
            elapsed_ms = self.elapsed_ms,
            response_id = %self.response_id,
            "Round complete"
        );
    }
}

/// Drive the bounded dialogue against an already-opened dispatcher.
///
/// Round 0 sends the task with forced tool use (downgraded to auto when the
/// catalogue is empty); subsequent rounds send only the injected tool
/// results, because the stateful endpoint holds the conversation history
/// server-side. Tool calls are executed sequentially in the order the LLM
/// returned them - effects may be ordered, and a write followed by a read in
/// the same round must observe the write.
pub async fn run_dialogue(
    transport: &dyn LlmTransport,
    lifecycle: Option<&ModelLifecycle>,
    dispatcher: &dyn ToolDispatcher,
    request: &AutonomousRequest,
    numeric_names: &HashSet<String>,
) -> Result<String> {
    let catalogue = dispatcher.catalogue();
    let tools = catalogue.llm_tools();

    let mut previous_response_id: Option<String> = None;
    let mut injection = String::new();
    let mut last_text: Option<String> = None;
    let mut round: u32 = 0;

    loop {
        if round >= request.max_rounds {
            warn!(
                rounds = round,
                "Round budget exhausted without a terminal answer"
            );
            return Ok(match last_text {
                Some(ref text) if !text.is_empty() => {
                    format!("{} {}", EXHAUSTED_MARKER, text)
                }
                _ => EXHAUSTED_MARKER.to_string(),
            });
        }

        let (input, kind) = if round == 0 {
            (request.task.clone(), "initial")
        } else {
            (
                format!("{}\n{}", injection, CONTINUATION_PROMPT),
                "continuation",
            )
        };

        let tool_choice = if catalogue.is_empty() {
            None
        } else if round == 0 {
            Some(ToolChoice::Required)
        } else {
            Some(ToolChoice::Auto)
        };

        let respond_request = RespondRequest {
            model: request.model.clone(),
            input,
            tools: tools.clone(),
            previous_response_id: previous_response_id.clone(),
            tool_choice,
            max_output_tokens: request.max_tokens,
        };

        let started = Instant::now();
        let mut reply_result = transport.respond(respond_request.clone()).await;

        // A vanished model gets one reactivation attempt before the round fails.
        if let Err(PonteError::ModelNotFound { ref model }) = reply_result
            && let Some(lifecycle) = lifecycle
        {
            warn!(model = %model, "Runtime lost the model mid-query, reactivating");
            lifecycle.invalidate(model);
            lifecycle
                .ensure_active(request.model.as_deref(), DEFAULT_MODEL_TTL_SECS)
                .await?;
            reply_result = transport.respond(respond_request).await;
        }
        let reply = reply_result?;

        RoundRecord {
            round,
            kind,
            tool_calls: reply.tool_calls.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            response_id: reply.response_id.clone(),
        }
        .log();

        previous_response_id = Some(reply.response_id.clone());
        if let Some(ref text) = reply.text {
            last_text = Some(text.clone());
        }

        // Terminal: textual output and no function calls.
        if reply.tool_calls.is_empty() {
            return match reply.text {
                Some(_) => Ok(formatter::render_reply(&reply)),
                None => Err(PonteError::LlmProtocol(
                    "response contained neither output text nor tool calls".into(),
                )),
            };
        }

        injection.clear();
        for call in &reply.tool_calls {
            let payload = match catalogue.resolve(&call.name) {
                None => {
                    warn!(tool = %call.name, "LLM called a tool that is not in the catalogue");
                    format!(
                        "[error] unknown tool '{}'; available tools: {}",
                        call.name,
                        catalogue.exposed_names().join(", ")
                    )
                }
                Some(entry) => {
                    let prepared = schema::normalize_arguments(&call.arguments).and_then(
                        |mut args| {
                            schema::coerce_arguments(&mut args, &entry.parameters, numeric_names)?;
                            Ok(args)
                        },
                    );
                    match prepared {
                        Err(e) => {
                            warn!(tool = %call.name, error = %e, "Tool arguments rejected");
                            format!("[error] {}", e)
                        }
                        Ok(args) => {
                            // Transport-level downstream failures abort the
                            // query; server-reported errors go back to the
                            // LLM, which may self-correct.
                            let outcome = dispatcher
                                .dispatch(&entry.server, &entry.tool_name, args)
                                .await?;
                            if outcome.is_error {
                                format!("[error] {}", outcome.text)
                            } else {
                                outcome.text
                            }
                        }
                    }
                }
            };
            injection.push_str(&format!("Tool '{}' returned: {}\n", call.name, payload));
        }

        round += 1;
    }
}

/// Process-wide engine shared by every north-side tool. Holds the transport
/// and lifecycle manager; everything per-query (registry snapshot, sessions,
/// catalogue) is built fresh inside `execute`.
pub struct Engine {
    env: EnvConfig,
    transport: Arc<dyn LlmTransport>,
    lifecycle: Arc<ModelLifecycle>,
}

impl Engine {
    pub fn new(
        env: EnvConfig,
        transport: Arc<dyn LlmTransport>,
        lifecycle: Arc<ModelLifecycle>,
    ) -> Self {
        Self {
            env,
            transport,
            lifecycle,
        }
    }

    pub fn env(&self) -> &EnvConfig {
        &self.env
    }

    /// Enabled registry identifiers, re-read from disk on every call.
    pub fn list_mcps(&self) -> Result<Vec<String>> {
        Ok(registry::load_snapshot(&self.env)?.list())
    }

    /// Run one autonomous invocation end to end. Every session opened here
    /// is closed before this returns, on success and on every failure path.
    pub async fn execute(&self, request: AutonomousRequest) -> Result<String> {
        let snapshot = registry::load_snapshot(&self.env)?;

        let names = if request.downstreams.is_empty() {
            snapshot.list()
        } else {
            request.downstreams.clone()
        };
        if names.is_empty() {
            return Err(PonteError::Registry {
                path: snapshot.path.display().to_string(),
                message: "no enabled downstream servers".to_string(),
            });
        }

        let mut configs: Vec<DownstreamConfig> = Vec::with_capacity(names.len());
        for name in &names {
            configs.push(snapshot.resolve(name)?.clone());
        }

        self.lifecycle
            .ensure_active(request.model.as_deref(), DEFAULT_MODEL_TTL_SECS)
            .await?;

        let sessions = SessionSet::open(&configs).await?;
        let numeric_names = self.env.numeric_params();

        info!(
            downstreams = ?names,
            model = request.model.as_deref().unwrap_or("(default)"),
            max_rounds = request.max_rounds,
            "Starting autonomous query"
        );

        let outcome = timeout(
            self.env.query_timeout,
            run_dialogue(
                self.transport.as_ref(),
                Some(&self.lifecycle),
                &sessions,
                &request,
                &numeric_names,
            ),
        )
        .await;

        sessions.close_all().await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(PonteError::LlmTimeout {
                seconds: self.env.query_timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request = AutonomousRequest::new("do things", vec!["fs".into()]);
        assert_eq!(request.max_rounds, ROUND_CEILING);
        assert!(request.model.is_none());
        assert!(request.max_tokens.is_none());
    }

    #[test]
    fn test_round_ceiling_is_effectively_unlimited() {
        assert_eq!(ROUND_CEILING, 10_000);
    }

    #[test]
    fn test_marker_is_machine_readable_prefix() {
        assert!(EXHAUSTED_MARKER.starts_with('['));
        assert!(EXHAUSTED_MARKER.ends_with(']'));
    }
}
