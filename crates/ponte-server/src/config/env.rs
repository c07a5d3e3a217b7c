// crates/ponte-server/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Default LM Studio host
const DEFAULT_HOST: &str = "localhost";
/// Default LM Studio port
const DEFAULT_PORT: u16 = 1234;
/// Default transient-failure retry attempts
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base backoff between retries (doubles each attempt)
const DEFAULT_RETRY_BASE_DELAY_SECS: f64 = 1.0;
/// Default ceiling on a single backoff sleep
const DEFAULT_RETRY_MAX_DELAY_SECS: f64 = 10.0;
/// Default per-query budget. The caller is an MCP tool whose own deadline is
/// 60 s; the whole invocation must finish inside that.
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 55;

/// Parameter names coerced to numbers when a small model sends them as
/// strings, even if the tool schema does not declare a numeric type.
const DEFAULT_NUMERIC_PARAMS: &[&str] = &[
    "limit",
    "max_results",
    "count",
    "offset",
    "page",
    "page_size",
    "per_page",
    "top_k",
    "head",
    "tail",
    "depth",
    "max_tokens",
];

/// Environment configuration - all env vars in one place
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// LM Studio host (LMSTUDIO_HOST)
    pub host: String,
    /// LM Studio port (LMSTUDIO_PORT)
    pub port: u16,
    /// Default model identifier passed verbatim to the transport (DEFAULT_MODEL)
    pub default_model: Option<String>,
    /// Registry file override (MCP_JSON_PATH)
    pub mcp_json_path: Option<PathBuf>,
    /// Transient-failure retry attempts (LMS_MAX_RETRIES)
    pub max_retries: u32,
    /// Base retry backoff (LMS_RETRY_BASE_DELAY, seconds)
    pub retry_base_delay: Duration,
    /// Retry backoff ceiling (LMS_RETRY_MAX_DELAY, seconds)
    pub retry_max_delay: Duration,
    /// Extra parameter names for numeric coercion (LMS_EXTRA_NUMERIC_PARAMS)
    pub extra_numeric_params: HashSet<String>,
    /// Per-query budget for one autonomous invocation (PONTE_QUERY_TIMEOUT_SECS)
    pub query_timeout: Duration,
}

impl EnvConfig {
    /// Load all environment configuration (call once at startup)
    pub fn load() -> Self {
        debug!("Loading environment configuration");

        let host = read_var("LMSTUDIO_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = read_var("LMSTUDIO_PORT")
            .and_then(|p| match p.parse() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!(value = %p, "Invalid LMSTUDIO_PORT, using {}", DEFAULT_PORT);
                    None
                }
            })
            .unwrap_or(DEFAULT_PORT);

        Self {
            host,
            port,
            default_model: read_var("DEFAULT_MODEL"),
            mcp_json_path: read_var("MCP_JSON_PATH").map(PathBuf::from),
            max_retries: read_parsed("LMS_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retry_base_delay: Duration::from_secs_f64(read_parsed(
                "LMS_RETRY_BASE_DELAY",
                DEFAULT_RETRY_BASE_DELAY_SECS,
            )),
            retry_max_delay: Duration::from_secs_f64(read_parsed(
                "LMS_RETRY_MAX_DELAY",
                DEFAULT_RETRY_MAX_DELAY_SECS,
            )),
            extra_numeric_params: read_var("LMS_EXTRA_NUMERIC_PARAMS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            query_timeout: Duration::from_secs(read_parsed(
                "PONTE_QUERY_TIMEOUT_SECS",
                DEFAULT_QUERY_TIMEOUT_SECS,
            )),
        }
    }

    /// Base URL of the LLM runtime, without a trailing slash or /v1 suffix.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Full numeric-coercion name set: built-in defaults plus user extensions.
    pub fn numeric_params(&self) -> HashSet<String> {
        let mut set: HashSet<String> = DEFAULT_NUMERIC_PARAMS
            .iter()
            .map(|s| s.to_string())
            .collect();
        set.extend(self.extra_numeric_params.iter().cloned());
        set
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.port == 0 {
            validation.add_error("LMSTUDIO_PORT must be non-zero");
        }
        if self.max_retries == 0 {
            validation.add_warning("LMS_MAX_RETRIES is 0 - transient failures will not be retried");
        }
        if self.retry_base_delay > self.retry_max_delay {
            validation.add_warning(
                "LMS_RETRY_BASE_DELAY exceeds LMS_RETRY_MAX_DELAY - backoff will be capped immediately",
            );
        }
        if let Some(ref path) = self.mcp_json_path
            && !path.exists()
        {
            validation.add_warning(format!(
                "MCP_JSON_PATH points to a missing file: {}",
                path.display()
            ));
        }

        validation
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            default_model: None,
            mcp_json_path: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_secs_f64(DEFAULT_RETRY_BASE_DELAY_SECS),
            retry_max_delay: Duration::from_secs_f64(DEFAULT_RETRY_MAX_DELAY_SECS),
            extra_numeric_params: HashSet::new(),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }
}

/// Read an env var, filtering empty values
fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Read and parse an env var, falling back to a default on absence or garbage
fn read_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match read_var(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "Unparseable value, using default");
            default
        }),
        None => default,
    }
}

/// Configuration validation result
#[derive(Debug)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Default for ConfigValidation {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Format as a human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {}", err));
            }
        }

        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for warn in &self.warnings {
                lines.push(format!("  - {}", warn));
            }
        }

        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }
}
