// crates/ponte-server/src/llm/mod.rs
// LLM runtime transport (LM Studio)

mod chat;
mod circuit_breaker;
mod client;
mod http_client;
pub mod logging;
mod responses;
mod types;

pub use chat::{ChatMessage, ChatRequest, parse_chat_body};
pub use circuit_breaker::CircuitBreaker;
pub use client::{LlmTransport, LmStudioClient, ModelRuntime};
pub use http_client::LlmHttpClient;
pub use responses::{ResponsesRequest, parse_responses_body};
pub use types::{
    LlmReply, LlmTool, ModelInfo, ModelStatus, RespondRequest, ToolCall, ToolChoice, Usage,
};
