// crates/ponte-server/src/llm/client.rs
// LM Studio runtime client (OpenAI-compatible endpoints, no auth)

use crate::config::EnvConfig;
use crate::error::{PonteError, Result};
use crate::llm::chat::{ChatMessage, ChatRequest, parse_chat_body};
use crate::llm::http_client::LlmHttpClient;
use crate::llm::responses::{ResponsesRequest, parse_responses_body};
use crate::llm::types::{LlmReply, LlmTool, ModelInfo, ModelStatus, RespondRequest, ToolChoice};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{Span, debug, info, instrument, warn};
use uuid::Uuid;

/// The enclosing MCP tool call has a 60 s deadline; completions must finish
/// inside it with room for dispatch overhead.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(58);
/// Model listing is cheap; anything slower is a sign of trouble.
const LISTING_TIMEOUT: Duration = Duration::from_secs(10);
/// Health probe budget.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport seam consumed by the autonomous loop.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// One turn on the stateful response path.
    async fn respond(&self, request: RespondRequest) -> Result<LlmReply>;
}

/// Runtime-control seam consumed by the model lifecycle manager.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
    async fn load_model(&self, model: &str, ttl_secs: u64) -> Result<()>;
    async fn unload_model(&self, model: &str) -> Result<()>;
}

/// Normalize a runtime base URL by stripping trailing slashes and /v1 suffix
fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim_end_matches('/').to_string();
    if url.ends_with("/v1") {
        url.truncate(url.len() - 3);
    }
    url
}

/// Check if a URL points to a local address (localhost, 127.0.0.1, [::1])
fn is_local_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => match parsed.host() {
            Some(url::Host::Domain(d)) => d == "localhost",
            Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
            Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
            None => true,
        },
        Err(_) => true, // Can't parse — don't warn on malformed URLs
    }
}

/// LM Studio API client. Process-wide and shared; reqwest pools connections
/// internally, so cloning an Arc of this is the only sharing needed.
pub struct LmStudioClient {
    base_url: String,
    default_model: Option<String>,
    http: LlmHttpClient,
}

impl LmStudioClient {
    pub fn new(base_url: String) -> Self {
        Self::with_http(base_url, None, LlmHttpClient::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
        ))
    }

    pub fn from_env(config: &EnvConfig) -> Self {
        Self::with_http(
            config.base_url(),
            config.default_model.clone(),
            LlmHttpClient::from_env(config),
        )
    }

    pub fn with_http(base_url: String, default_model: Option<String>, http: LlmHttpClient) -> Self {
        let normalized = normalize_base_url(&base_url);

        if !is_local_url(&normalized) {
            warn!(
                "LMSTUDIO_HOST points to non-local address '{}'. For security, consider using localhost.",
                normalized
            );
        }

        Self {
            base_url: normalized,
            default_model,
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve the effective model identifier for a request. `None` and the
    /// sentinel "default" defer to the runtime's default model.
    fn effective_model(&self, requested: Option<&str>) -> Option<String> {
        match requested {
            Some(m) if !m.is_empty() && m != "default" => Some(m.to_string()),
            _ => self
                .default_model
                .as_deref()
                .filter(|m| !m.is_empty() && *m != "default")
                .map(String::from),
        }
    }

    /// Map a permanent runtime API error to the internal model-not-found
    /// marker when the body says the model is gone.
    fn classify_api_error(err: PonteError, model: Option<&str>) -> PonteError {
        if let PonteError::RuntimeApi { status, ref body } = err
            && let Some(model) = model
            && (status == 404 || body.contains("model_not_found") || body.contains("No model"))
        {
            return PonteError::ModelNotFound {
                model: model.to_string(),
            };
        }
        err
    }

    /// Chat-completions fallback for callers that cannot use the stateful
    /// path. History must be resent by the caller on every turn.
    #[instrument(skip(self, messages, tools), fields(request_id))]
    pub async fn chat(
        &self,
        model: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: &[LlmTool],
        tool_choice: Option<ToolChoice>,
        max_tokens: Option<u32>,
    ) -> Result<LlmReply> {
        let request_id = Uuid::new_v4().to_string();
        let start_time = Instant::now();
        Span::current().record("request_id", &request_id);

        let model = self.effective_model(model);
        let request = ChatRequest::new(model.clone(), messages)
            .with_tools(tools, tool_choice)
            .with_max_tokens(max_tokens);
        let body = serde_json::to_string(&request)?;
        debug!(request_id = %request_id, "Chat request: {}", body);

        let url = format!("{}/v1/chat/completions", self.base_url);
        let response_body = self
            .http
            .execute_with_retry(&request_id, |client| {
                client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .timeout(COMPLETION_TIMEOUT)
                    .body(body.clone())
            })
            .await
            .map_err(|e| Self::classify_api_error(e, model.as_deref()))?;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let result = parse_chat_body(&response_body, &request_id, duration_ms)?;

        if !result.tool_calls.is_empty() {
            crate::llm::logging::log_tool_calls(&request_id, &result.tool_calls);
        }
        crate::llm::logging::log_completion(
            &request_id,
            duration_ms,
            result.text.as_ref().map(|c| c.len()).unwrap_or(0),
            result
                .reasoning_content
                .as_ref()
                .map(|r| r.len())
                .unwrap_or(0),
            result.tool_calls.len(),
        );

        Ok(result)
    }

    async fn respond_inner(&self, request: RespondRequest) -> Result<LlmReply> {
        let request_id = Uuid::new_v4().to_string();
        let start_time = Instant::now();

        let mut request = request;
        request.model = self.effective_model(request.model.as_deref());

        info!(
            request_id = %request_id,
            model = request.model.as_deref().unwrap_or("(runtime default)"),
            tool_count = request.tools.len(),
            continuation = request.previous_response_id.is_some(),
            input_len = request.input.len(),
            "Starting stateful request"
        );

        let wire = ResponsesRequest::from_respond(&request);
        let body = serde_json::to_string(&wire)?;
        debug!(request_id = %request_id, "Responses request: {}", body);

        let url = format!("{}/v1/responses", self.base_url);
        let response_body = self
            .http
            .execute_with_retry(&request_id, |client| {
                client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .timeout(COMPLETION_TIMEOUT)
                    .body(body.clone())
            })
            .await
            .map_err(|e| Self::classify_api_error(e, request.model.as_deref()))?;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let result = parse_responses_body(&response_body, &request_id, duration_ms)?;

        if let Some(ref usage) = result.usage {
            crate::llm::logging::log_usage(&request_id, usage);
        }
        if !result.tool_calls.is_empty() {
            crate::llm::logging::log_tool_calls(&request_id, &result.tool_calls);
        }
        crate::llm::logging::log_completion(
            &request_id,
            duration_ms,
            result.text.as_ref().map(|c| c.len()).unwrap_or(0),
            result
                .reasoning_content
                .as_ref()
                .map(|r| r.len())
                .unwrap_or(0),
            result.tool_calls.len(),
        );

        Ok(result)
    }

    /// Probe the runtime. Cheap listing call with a tight budget.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .http
            .inner()
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PonteError::Transport(format!(
                "runtime health check returned {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl LlmTransport for LmStudioClient {
    async fn respond(&self, request: RespondRequest) -> Result<LlmReply> {
        self.respond_inner(request).await
    }
}

/// Listing response from /api/v0/models. The `state` field is what makes the
/// endpoint usable: mere presence does not mean the model can serve.
#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    state: Option<String>,
}

fn parse_model_state(state: Option<&str>) -> ModelStatus {
    match state {
        Some("loaded") | Some("active") => ModelStatus::Active,
        Some("idle") => ModelStatus::Idle,
        Some("loading") => ModelStatus::Loading,
        _ => ModelStatus::Absent,
    }
}

#[async_trait]
impl ModelRuntime for LmStudioClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let request_id = Uuid::new_v4().to_string();
        let url = format!("{}/api/v0/models", self.base_url);
        let body = self
            .http
            .execute_with_retry(&request_id, |client| {
                client.get(&url).timeout(LISTING_TIMEOUT)
            })
            .await?;

        let listing: ModelListing = serde_json::from_str(&body)
            .map_err(|e| PonteError::LlmProtocol(format!("malformed model listing: {}", e)))?;

        Ok(listing
            .data
            .into_iter()
            .map(|entry| ModelInfo {
                status: parse_model_state(entry.state.as_deref()),
                id: entry.id,
            })
            .collect())
    }

    async fn load_model(&self, model: &str, ttl_secs: u64) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        info!(model, ttl_secs, "Loading model");
        let url = format!("{}/api/v1/models/load", self.base_url);
        let body = serde_json::to_string(&json!({"model": model, "ttl": ttl_secs}))?;
        self.http
            .execute_with_retry(&request_id, |client| {
                client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .timeout(COMPLETION_TIMEOUT)
                    .body(body.clone())
            })
            .await
            .map_err(|e| Self::classify_api_error(e, Some(model)))?;
        Ok(())
    }

    async fn unload_model(&self, model: &str) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        info!(model, "Unloading model");
        let url = format!("{}/api/v1/models/unload", self.base_url);
        let body = serde_json::to_string(&json!({"model": model}))?;
        self.http
            .execute_with_retry(&request_id, |client| {
                client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .timeout(LISTING_TIMEOUT)
                    .body(body.clone())
            })
            .await
            .map_err(|e| Self::classify_api_error(e, Some(model)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_normalization() {
        let client = LmStudioClient::new("http://localhost:1234/v1".into());
        assert_eq!(client.base_url(), "http://localhost:1234");

        let client = LmStudioClient::new("http://localhost:1234/v1/".into());
        assert_eq!(client.base_url(), "http://localhost:1234");

        let client = LmStudioClient::new("http://localhost:1234/".into());
        assert_eq!(client.base_url(), "http://localhost:1234");
    }

    #[test]
    fn test_is_local_url() {
        assert!(is_local_url("http://localhost:1234"));
        assert!(is_local_url("http://127.0.0.1:1234"));
        assert!(is_local_url("http://[::1]:1234"));
        assert!(!is_local_url("http://192.168.1.100:1234"));
        assert!(!is_local_url("http://inference.example.com:1234"));
    }

    #[test]
    fn test_effective_model_sentinels() {
        let client = LmStudioClient::new("http://localhost:1234".into());
        assert_eq!(client.effective_model(None), None);
        assert_eq!(client.effective_model(Some("")), None);
        assert_eq!(client.effective_model(Some("default")), None);
        assert_eq!(
            client.effective_model(Some("qwen2.5-7b")),
            Some("qwen2.5-7b".to_string())
        );
    }

    #[test]
    fn test_effective_model_env_default() {
        let http = LlmHttpClient::new(1, Duration::from_millis(1), Duration::from_millis(2));
        let client = LmStudioClient::with_http(
            "http://localhost:1234".into(),
            Some("llama-3.2-3b".into()),
            http,
        );
        assert_eq!(
            client.effective_model(None),
            Some("llama-3.2-3b".to_string())
        );
        // An explicit request still wins over the configured default.
        assert_eq!(
            client.effective_model(Some("qwen2.5-7b")),
            Some("qwen2.5-7b".to_string())
        );
    }

    #[test]
    fn test_parse_model_state() {
        assert_eq!(parse_model_state(Some("loaded")), ModelStatus::Active);
        assert_eq!(parse_model_state(Some("idle")), ModelStatus::Idle);
        assert_eq!(parse_model_state(Some("loading")), ModelStatus::Loading);
        assert_eq!(parse_model_state(Some("not-loaded")), ModelStatus::Absent);
        assert_eq!(parse_model_state(None), ModelStatus::Absent);
    }

    #[test]
    fn test_classify_api_error_model_not_found() {
        let err = PonteError::RuntimeApi {
            status: 404,
            body: "model_not_found".into(),
        };
        let classified = LmStudioClient::classify_api_error(err, Some("qwen"));
        assert!(matches!(classified, PonteError::ModelNotFound { .. }));

        // Without a model identifier the error passes through.
        let err = PonteError::RuntimeApi {
            status: 404,
            body: "model_not_found".into(),
        };
        let classified = LmStudioClient::classify_api_error(err, None);
        assert!(matches!(classified, PonteError::RuntimeApi { .. }));
    }
}
