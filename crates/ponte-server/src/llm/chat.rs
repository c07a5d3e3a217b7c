// crates/ponte-server/src/llm/chat.rs
// Chat-completions fallback codec (/v1/chat/completions)
//
// Used when the stateful endpoint is unavailable or inappropriate. The wire
// format is plain OpenAI chat: tools are nested under a `function` key, so
// the flat LlmTool shape is re-nested here and nowhere else.

use crate::error::{PonteError, Result};
use crate::llm::types::{LlmReply, LlmTool, ToolCall, ToolChoice, Usage};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: String, // "system" | "user" | "assistant" | "tool"
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Chat completion request (OpenAI-compatible format)
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: Option<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model,
            messages,
            tools: None,
            tool_choice: None,
            max_tokens: None,
        }
    }

    /// Attach tools, re-nesting the flat shape into OpenAI form.
    pub fn with_tools(mut self, tools: &[LlmTool], tool_choice: Option<ToolChoice>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools.iter().map(nest_tool).collect());
            self.tool_choice = Some(
                match tool_choice.unwrap_or(ToolChoice::Auto) {
                    ToolChoice::Auto => "auto",
                    ToolChoice::Required => "required",
                }
                .to_string(),
            );
        }
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Flat tool descriptor -> nested OpenAI `{type, function: {...}}`.
fn nest_tool(tool: &LlmTool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: String,
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    arguments: Value,
}

/// Parse an OpenAI-compatible chat response into an `LlmReply`.
///
/// The chat path has no server-side conversation, so the returned
/// `response_id` cannot chain a next turn; callers on this path must resend
/// history themselves.
pub fn parse_chat_body(body: &str, request_id: &str, duration_ms: u64) -> Result<LlmReply> {
    let data: ChatResponse = serde_json::from_str(body)
        .map_err(|e| PonteError::LlmProtocol(format!("malformed chat response: {}", e)))?;

    let choice = data.choices.into_iter().next();
    let (text, reasoning_content, reasoning, tool_calls) = match choice {
        Some(c) => {
            let msg = c.message;
            let calls = msg
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect();
            (msg.content, msg.reasoning_content, msg.reasoning, calls)
        }
        None => (None, None, None, Vec::new()),
    };

    Ok(LlmReply {
        request_id: request_id.to_owned(),
        response_id: data.id,
        text,
        reasoning_content,
        reasoning,
        tool_calls,
        usage: data.usage,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nest_tool_round_trips_schema() {
        let tool = LlmTool::function(
            "paginate",
            "Page through results",
            json!({"type": "object", "properties": {"head": {"type": "integer"}}}),
        );
        let nested = nest_tool(&tool);

        assert_eq!(nested["type"], "function");
        assert_eq!(nested["function"]["name"], "paginate");
        assert_eq!(
            nested["function"]["parameters"]["properties"]["head"]["type"],
            "integer"
        );
    }

    #[test]
    fn test_parse_simple_response() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{"message": {"content": "Hello!"}}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
        }"#;

        let reply = parse_chat_body(body, "req", 90).unwrap();
        assert_eq!(reply.text.as_deref(), Some("Hello!"));
        assert!(reply.tool_calls.is_empty());
        assert_eq!(reply.duration_ms, 90);
    }

    #[test]
    fn test_parse_tool_calls_with_string_arguments() {
        let body = r#"{
            "id": "chatcmpl-2",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "say", "arguments": "{\"text\":\"hi\"}"}
                    }]
                }
            }]
        }"#;

        let reply = parse_chat_body(body, "req", 0).unwrap();
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "say");
        // Arguments stay raw; the schema translator decodes them.
        assert!(reply.tool_calls[0].arguments.is_string());
    }

    #[test]
    fn test_parse_reasoning_channels() {
        let body = r#"{
            "choices": [{
                "message": {
                    "content": "42",
                    "reasoning_content": "deep thought",
                    "reasoning": "variant channel"
                }
            }]
        }"#;

        let reply = parse_chat_body(body, "req", 0).unwrap();
        assert_eq!(reply.reasoning_content.as_deref(), Some("deep thought"));
        assert_eq!(reply.reasoning.as_deref(), Some("variant channel"));
    }

    #[test]
    fn test_parse_empty_choices() {
        let reply = parse_chat_body(r#"{"choices": []}"#, "req", 0).unwrap();
        assert!(reply.text.is_none());
        assert!(reply.tool_calls.is_empty());
    }

    #[test]
    fn test_request_tools_nested_only_when_present() {
        let request = ChatRequest::new(None, vec![ChatMessage::user("hi")]).with_tools(&[], None);
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());

        let tools = vec![LlmTool::function("t", "d", json!({}))];
        let request = ChatRequest::new(Some("m".into()), vec![ChatMessage::user("hi")])
            .with_tools(&tools, Some(ToolChoice::Required));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["tools"][0]["function"]["name"], "t");
        assert_eq!(value["tool_choice"], "required");
    }
}
