//! Shared utility functions for the enhancer crate.

use std::time::Duration;

use anyhow::Context;

/// Strip an optional Markdown code fence around a model response.
///
/// Accepts "```json\n{...}\n```", "```\n{...}\n```", and bare text. Only a
/// fence that wraps the whole (trimmed) response is removed.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) on the opening line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// HTTP client whose requests fail after `timeout` instead of waiting on a
/// peer that never answers.
pub fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Shorten `text` to at most `max_chars` characters for log output.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence_bare_json() {
        assert_eq!(strip_code_fence(r#"{"key": "value"}"#), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_strip_code_fence_json_fence() {
        let text = "```json\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_code_fence(text), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_strip_code_fence_plain_fence_with_whitespace() {
        let text = "  \n```\n[1, 2]\n```\n ";
        assert_eq!(strip_code_fence(text), "[1, 2]");
    }

    #[test]
    fn test_strip_code_fence_missing_closing_fence() {
        let text = "```json\n{\"a\": 1}";
        assert_eq!(strip_code_fence(text), r#"{"a": 1}"#);
    }

    #[test]
    fn test_strip_code_fence_leaves_prose_alone() {
        let text = "Here you go: {\"a\": 1}";
        assert_eq!(strip_code_fence(text), text);
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
        assert_eq!(preview("", 3), "");
    }
}
