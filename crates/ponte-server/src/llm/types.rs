// crates/ponte-server/src/llm/types.rs
// Shared LLM types for tools, tool calls, and replies

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition in the flat shape the runtime requires:
/// `{type: "function", name, description, parameters}` - not nested under a
/// `function` key. The parameter schema passes through opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmTool {
    #[serde(rename = "type")]
    pub tool_type: String, // "function"
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

impl LlmTool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            tool_type: "function".into(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Tool call from the model. `arguments` is kept raw: the runtime often
/// returns a JSON-encoded string instead of a structured object, and the
/// schema translator decides how to decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Whether the model is obliged to call a tool on this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    Required,
}

/// One request on the stateful response path. When `previous_response_id`
/// is set the runtime holds the conversation server-side and `input` carries
/// only the new turn.
#[derive(Debug, Clone)]
pub struct RespondRequest {
    pub model: Option<String>,
    pub input: String,
    pub tools: Vec<LlmTool>,
    pub previous_response_id: Option<String>,
    pub tool_choice: Option<ToolChoice>,
    pub max_output_tokens: Option<u32>,
}

/// Usage statistics
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u32,
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Result of one LLM request (stateful or fallback path)
#[derive(Clone, Debug)]
pub struct LlmReply {
    pub request_id: String,
    /// Runtime conversation handle for chaining the next turn.
    pub response_id: String,
    pub text: Option<String>,
    pub reasoning_content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub duration_ms: u64,
}

/// Resident-model status as reported by the runtime's listing endpoint.
/// Only `active` permits a request to proceed; `idle` means present but not
/// serving and must be treated as unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ModelStatus {
    Active,
    Idle,
    Loading,
    Absent,
}

/// One entry from the runtime's model listing.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub status: ModelStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_llm_tool_serializes_flat() {
        let tool = LlmTool::function("say", "Say something", json!({"type": "object"}));
        let value = serde_json::to_value(&tool).unwrap();

        assert_eq!(value["type"], "function");
        assert_eq!(value["name"], "say");
        assert_eq!(value["description"], "Say something");
        // Flat: no nested "function" key
        assert!(value.get("function").is_none());
    }

    #[test]
    fn test_tool_choice_serialization() {
        assert_eq!(
            serde_json::to_string(&ToolChoice::Required).unwrap(),
            "\"required\""
        );
        assert_eq!(serde_json::to_string(&ToolChoice::Auto).unwrap(), "\"auto\"");
    }

    #[test]
    fn test_model_status_display() {
        assert_eq!(ModelStatus::Active.to_string(), "active");
        assert_eq!(ModelStatus::Idle.to_string(), "idle");
        assert_eq!(ModelStatus::Loading.to_string(), "loading");
        assert_eq!(ModelStatus::Absent.to_string(), "absent");
    }

    #[test]
    fn test_usage_accepts_openai_aliases() {
        let usage: Usage = serde_json::from_str(
            r#"{"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}"#,
        )
        .unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }
}
