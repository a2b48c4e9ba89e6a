//! Sensitive-header placeholders and log redaction.
//!
//! Secrets never live in task rows: at ingest, values of sensitive headers
//! are rewritten to `{{NAME}}` placeholders derived purely from the header
//! name; at dispatch, placeholders are resolved against the read-only
//! bindings loaded at startup. An unresolved placeholder is logged and sent
//! literally (the remote may reject, which journals like any failure).
//!
//! Redaction is a logging concern only — the wire request always carries
//! the real values after substitution.

use std::collections::HashMap;

use tracing::warn;

/// Header names whose values are secrets, matched case-insensitively.
pub const SENSITIVE_HEADERS: &[&str] =
    &["Authorization", "Cookie", "Set-Cookie", "X-Auth-Token", "Api-Key", "Token"];

/// Maximum characters of a request or response body in a log line.
pub const LOG_BODY_LIMIT: usize = 100;

/// Whether a header name belongs to the sensitive set.
pub fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS.iter().any(|s| s.eq_ignore_ascii_case(name))
}

/// Placeholder for a sensitive header, derived purely from its name:
/// `Api-Key` becomes `{{API_KEY}}`.
pub fn placeholder_for(name: &str) -> String {
    format!("{{{{{}}}}}", name.to_ascii_uppercase().replace('-', "_"))
}

/// The binding name inside a `{{NAME}}` placeholder value, if the value has
/// that shape.
pub fn parse_placeholder(value: &str) -> Option<&str> {
    let inner = value.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    (!inner.is_empty()).then_some(inner)
}

/// Rewrites sensitive header values to placeholders before storage.
///
/// Non-sensitive headers pass through untouched. The mapping is a pure
/// function of the header name; nothing about the secret value is recorded.
pub fn rewrite_sensitive(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            if is_sensitive(name) {
                (name.clone(), placeholder_for(name))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Resolves placeholders against the sensitive-value bindings at dispatch
/// time.
///
/// Bindings are keyed by the bare name (`API_KEY`, not `{{API_KEY}}`). A
/// placeholder with no binding is kept literal and logged; delivery
/// proceeds.
pub fn render(
    headers: &HashMap<String, String>,
    bindings: &HashMap<String, String>,
    task_id: &str,
) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let rendered = match parse_placeholder(value) {
                Some(binding_name) => match bindings.get(binding_name) {
                    Some(real) => real.clone(),
                    None => {
                        warn!(
                            task_id,
                            header = name.as_str(),
                            binding = binding_name,
                            "no binding for sensitive header placeholder, sending literal"
                        );
                        value.clone()
                    },
                },
                None => value.clone(),
            };
            (name.clone(), rendered)
        })
        .collect()
}

/// Replaces sensitive header values with `[REDACTED]` for log lines.
pub fn redact(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            if is_sensitive(name) {
                (name.clone(), "[REDACTED]".to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Truncates a body for logging, marking the cut.
pub fn truncate_for_log(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }

    // Cut on a char boundary at or below the limit.
    let cut = body.char_indices().take_while(|(i, _)| *i <= limit).last().map_or(0, |(i, _)| i);
    format!("{}...", &body[..cut])
}
