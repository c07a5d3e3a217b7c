// crates/ponte-server/src/llm/logging.rs
// Shared LLM logging helpers

use super::types::{ToolCall, Usage};
use tracing::{debug, info};

/// Log usage statistics for an LLM call.
pub fn log_usage(request_id: &str, usage: &Usage) {
    info!(
        request_id = %request_id,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.total_tokens,
        "Runtime usage stats"
    );
}

/// Log tool calls requested by the LLM.
pub fn log_tool_calls(request_id: &str, tool_calls: &[ToolCall]) {
    info!(
        request_id = %request_id,
        tool_count = tool_calls.len(),
        tools = ?tool_calls.iter().map(|tc| &tc.name).collect::<Vec<_>>(),
        "Runtime requested tool calls"
    );
    for tc in tool_calls {
        debug!(
            request_id = %request_id,
            tool = %tc.name,
            call_id = %tc.id,
            args = %tc.arguments,
            "Tool call"
        );
    }
}

/// Log completion summary for an LLM call.
pub fn log_completion(
    request_id: &str,
    duration_ms: u64,
    content_len: usize,
    reasoning_len: usize,
    tool_call_count: usize,
) {
    info!(
        request_id = %request_id,
        duration_ms = duration_ms,
        content_len = content_len,
        reasoning_len = reasoning_len,
        tool_calls = tool_call_count,
        "Runtime request complete"
    );
}
