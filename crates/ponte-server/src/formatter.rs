// crates/ponte-server/src/formatter.rs
// Reasoning-aware response formatting: separates the chain-of-thought
// channel from the final answer before it goes back to the MCP client.

use crate::llm::LlmReply;

/// Soft cap on the rendered reasoning section.
const REASONING_CAP_CHARS: usize = 2000;
/// Overflow replacement marker.
const ELLIPSIS: char = '…';

/// Render a reply: reasoning section (when present) plus the answer.
pub fn render_reply(reply: &LlmReply) -> String {
    let answer = reply.text.as_deref().unwrap_or("");
    render(
        answer,
        reply.reasoning_content.as_deref(),
        reply.reasoning.as_deref(),
    )
}

/// Core rendering. `reasoning_content` is the majority channel; `reasoning`
/// is a variant used by one known model family and only consulted when the
/// former is empty. Whitespace-only reasoning produces no section at all.
pub fn render(answer: &str, reasoning_content: Option<&str>, reasoning: Option<&str>) -> String {
    let chosen = [reasoning_content, reasoning]
        .into_iter()
        .flatten()
        .find(|r| !r.trim().is_empty());

    match chosen {
        Some(raw) => {
            let escaped = escape_html(raw.trim());
            let bounded = truncate_chars(&escaped, REASONING_CAP_CHARS);
            format!(
                "Reasoning Process:\n{}\n\nFinal Answer:\n{}",
                bounded, answer
            )
        }
        None => answer.to_string(),
    }
}

/// The reasoning payload may end up in viewers that render markup; escape it.
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Truncate to at most `cap` characters, replacing the overflow with an
/// ellipsis marker. Character-based, so multi-byte input cannot split.
fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        return s.to_string();
    }
    let mut out: String = s.chars().take(cap.saturating_sub(1)).collect();
    out.push(ELLIPSIS);
    out
}
