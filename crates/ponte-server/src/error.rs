// crates/ponte-server/src/error.rs
// Standardized error types for Ponte

use thiserror::Error;

/// Main error type for the Ponte library
#[derive(Error, Debug)]
pub enum PonteError {
    #[error("registry at {path}: {message}")]
    Registry { path: String, message: String },

    #[error("unknown MCP server '{name}' (available: {})", format_list(.available))]
    UnknownMcp { name: String, available: Vec<String> },

    #[error("handshake with MCP server '{server}' failed: {message}")]
    McpHandshake { server: String, message: String },

    #[error("call to MCP server '{server}' failed: {message}")]
    McpCall { server: String, message: String },

    #[error("model '{model}' could not be activated: {reason} (available: {})", format_list(.available))]
    ModelUnavailable {
        model: String,
        reason: String,
        available: Vec<String>,
    },

    /// Internal: the runtime rejected a request because the model is gone.
    /// The autonomous loop invalidates the lifecycle cache and retries once;
    /// if that fails the error is re-raised as `ModelUnavailable`.
    #[error("model '{model}' not found at runtime")]
    ModelNotFound { model: String },

    #[error("invalid tool arguments: {0}")]
    ToolArgument(String),

    #[error("unexpected LLM response: {0}")]
    LlmProtocol(String),

    #[error("LLM request timed out after {seconds}s")]
    LlmTimeout { seconds: u64 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("runtime API error {status}: {body}")]
    RuntimeApi { status: u16, body: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query cancelled")]
    Cancelled,
}

fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// Convenience type alias for Result using PonteError
pub type Result<T> = std::result::Result<T, PonteError>;

impl PonteError {
    /// Short kind tag for the user-facing error line.
    pub fn kind(&self) -> &'static str {
        match self {
            PonteError::Registry { .. } => "RegistryError",
            PonteError::UnknownMcp { .. } => "UnknownMCPError",
            PonteError::McpHandshake { .. } => "MCPHandshakeError",
            PonteError::McpCall { .. } => "MCPCallError",
            PonteError::ModelUnavailable { .. } | PonteError::ModelNotFound { .. } => {
                "ModelUnavailableError"
            }
            PonteError::ToolArgument(_) => "ToolArgumentError",
            PonteError::LlmProtocol(_) => "LLMProtocolError",
            PonteError::LlmTimeout { .. } => "LLMTimeout",
            PonteError::Transport(_) | PonteError::RuntimeApi { .. } | PonteError::Http(_) => {
                "TransportError"
            }
            PonteError::Config(_) => "ConfigError",
            PonteError::Io(_) => "IOError",
            PonteError::Json(_) => "JSONError",
            PonteError::Cancelled => "Cancelled",
        }
    }

    /// Convert to the single-line user-facing form used at MCP tool boundaries.
    pub fn to_user_string(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<String> for PonteError {
    fn from(s: String) -> Self {
        PonteError::Transport(s)
    }
}

impl From<tokio::task::JoinError> for PonteError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            PonteError::Cancelled
        } else {
            PonteError::Transport(err.to_string())
        }
    }
}

impl From<PonteError> for String {
    fn from(err: PonteError) -> Self {
        err.to_user_string()
    }
}
