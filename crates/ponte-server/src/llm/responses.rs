// crates/ponte-server/src/llm/responses.rs
// Stateful response endpoint codec (/v1/responses)

use crate::error::{PonteError, Result};
use crate::llm::types::{LlmReply, LlmTool, RespondRequest, ToolCall, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire request for the stateful endpoint. `store` must stay on or the
/// runtime will not accept the returned id as `previous_response_id`.
#[derive(Debug, Serialize)]
pub struct ResponsesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<LlmTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    pub store: bool,
}

impl ResponsesRequest {
    pub fn from_respond(request: &RespondRequest) -> Self {
        Self {
            model: request.model.clone(),
            input: request.input.clone(),
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(request.tools.clone())
            },
            tool_choice: request
                .tool_choice
                .map(|tc| match tc {
                    crate::llm::types::ToolChoice::Auto => "auto",
                    crate::llm::types::ToolChoice::Required => "required",
                })
                .map(String::from),
            previous_response_id: request.previous_response_id.clone(),
            max_output_tokens: request.max_output_tokens,
            store: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    id: String,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum OutputItem {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<ContentPart>,
        #[serde(default)]
        reasoning_content: Option<String>,
        #[serde(default)]
        reasoning: Option<String>,
    },
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    #[serde(rename = "reasoning")]
    Reasoning {
        #[serde(default)]
        content: Vec<ContentPart>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type", default)]
    part_type: String,
    #[serde(default)]
    text: String,
}

/// Parse a stateful-endpoint response into an `LlmReply`.
pub fn parse_responses_body(body: &str, request_id: &str, duration_ms: u64) -> Result<LlmReply> {
    let data: ResponsesResponse = serde_json::from_str(body)
        .map_err(|e| PonteError::LlmProtocol(format!("malformed response body: {}", e)))?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut reasoning_content: Option<String> = None;
    let mut reasoning: Option<String> = None;
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for item in data.output {
        match item {
            OutputItem::Message {
                content,
                reasoning_content: rc,
                reasoning: r,
            } => {
                for part in content {
                    if part.part_type == "output_text" || part.part_type == "text" {
                        text_parts.push(part.text);
                    }
                }
                if rc.is_some() {
                    reasoning_content = rc;
                }
                if r.is_some() {
                    reasoning = r;
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                tool_calls.push(ToolCall {
                    id: call_id,
                    name,
                    arguments,
                });
            }
            OutputItem::Reasoning { content } => {
                let joined: String = content
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("\n");
                if !joined.trim().is_empty() && reasoning_content.is_none() {
                    reasoning_content = Some(joined);
                }
            }
            OutputItem::Other => {}
        }
    }

    let text = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join(""))
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
    use crate::llm::types::ToolChoice;
    use serde_json::json;

    #[test]
    fn test_parse_text_response() {
        let body = r#"{
            "id": "resp_1",
            "output": [{
                "type": "message",
                "content": [{"type": "output_text", "text": "Hello, world!"}]
            }],
            "usage": {"input_tokens": 10, "output_tokens": 5, "total_tokens": 15}
        }"#;

        let reply = parse_responses_body(body, "req-1", 120).unwrap();
        assert_eq!(reply.response_id, "resp_1");
        assert_eq!(reply.text.as_deref(), Some("Hello, world!"));
        assert!(reply.tool_calls.is_empty());
        assert_eq!(reply.usage.unwrap().total_tokens, 15);
        assert_eq!(reply.duration_ms, 120);
    }

    #[test]
    fn test_parse_function_calls_preserve_order() {
        let body = r#"{
            "id": "resp_2",
            "output": [
                {"type": "function_call", "call_id": "c1", "name": "write", "arguments": "{\"path\":\"a\"}"},
                {"type": "function_call", "call_id": "c2", "name": "read", "arguments": "{\"path\":\"a\"}"}
            ]
        }"#;

        let reply = parse_responses_body(body, "req-2", 0).unwrap();
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].id, "c1");
        assert_eq!(reply.tool_calls[0].name, "write");
        assert_eq!(reply.tool_calls[1].id, "c2");
        assert_eq!(reply.tool_calls[1].name, "read");
    }

    #[test]
    fn test_parse_reasoning_item() {
        let body = r#"{
            "id": "resp_3",
            "output": [
                {"type": "reasoning", "content": [{"type": "reasoning_text", "text": "thinking hard"}]},
                {"type": "message", "content": [{"type": "output_text", "text": "42"}]}
            ]
        }"#;

        let reply = parse_responses_body(body, "req-3", 0).unwrap();
        assert_eq!(reply.reasoning_content.as_deref(), Some("thinking hard"));
        assert_eq!(reply.text.as_deref(), Some("42"));
    }

    #[test]
    fn test_parse_message_level_reasoning_fields() {
        let body = r#"{
            "id": "resp_4",
            "output": [{
                "type": "message",
                "content": [{"type": "output_text", "text": "done"}],
                "reasoning": "fallback channel"
            }]
        }"#;

        let reply = parse_responses_body(body, "req-4", 0).unwrap();
        assert!(reply.reasoning_content.is_none());
        assert_eq!(reply.reasoning.as_deref(), Some("fallback channel"));
    }

    #[test]
    fn test_unknown_output_items_skipped() {
        let body = r#"{
            "id": "resp_5",
            "output": [
                {"type": "web_search_call", "status": "completed"},
                {"type": "message", "content": [{"type": "output_text", "text": "ok"}]}
            ]
        }"#;

        let reply = parse_responses_body(body, "req-5", 0).unwrap();
        assert_eq!(reply.text.as_deref(), Some("ok"));
    }

    #[test]
    fn test_malformed_body_is_protocol_error() {
        let err = parse_responses_body("not json", "req", 0).unwrap_err();
        assert!(matches!(err, PonteError::LlmProtocol(_)));
    }

    #[test]
    fn test_request_serialization_omits_empty() {
        let request = RespondRequest {
            model: None,
            input: "hi".into(),
            tools: vec![],
            previous_response_id: None,
            tool_choice: Some(ToolChoice::Required),
            max_output_tokens: None,
        };
        let wire = ResponsesRequest::from_respond(&request);
        let value = serde_json::to_value(&wire).unwrap();

        assert_eq!(value["input"], "hi");
        assert_eq!(value["tool_choice"], "required");
        assert_eq!(value["store"], true);
        assert!(value.get("model").is_none());
        assert!(value.get("tools").is_none());
        assert!(value.get("previous_response_id").is_none());
    }

    #[test]
    fn test_request_carries_previous_handle_and_tools() {
        let request = RespondRequest {
            model: Some("qwen".into()),
            input: "continue".into(),
            tools: vec![LlmTool::function("say", "Say", json!({"type": "object"}))],
            previous_response_id: Some("resp_1".into()),
            tool_choice: Some(ToolChoice::Auto),
            max_output_tokens: Some(512),
        };
        let value = serde_json::to_value(ResponsesRequest::from_respond(&request)).unwrap();

        assert_eq!(value["previous_response_id"], "resp_1");
        assert_eq!(value["model"], "qwen");
        assert_eq!(value["max_output_tokens"], 512);
        assert_eq!(value["tools"][0]["name"], "say");
        assert_eq!(value["tools"][0]["type"], "function");
    }
}
