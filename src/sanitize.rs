//! Text and identifier sanitisation shared by the send path and the command
//! handler's payload validation.
//!
//! A single bounded escape pass, not a chain of regex replacements: reject
//! characters outside the allowed set rather than trying to escape them.
//! The injection blacklist is a fixed set, reproduced verbatim.

const MAX_TEXT_LEN: usize = 5000;

/// Patterns that indicate an attempt to break out of the chat-send action's
/// scripting context (shell invocation, cross-application control, nested
/// control blocks). Matched as plain substrings, case-insensitively.
const INJECTION_BLACKLIST: &[&str] = &[
    "do shell script",
    "tell application",
    "end tell",
    "osascript",
    "system events",
    "activate",
    "keystroke",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SanitizeError {
    #[error("text exceeds {MAX_TEXT_LEN} characters")]
    TooLong,
    #[error("text matches forbidden pattern '{0}'")]
    ForbiddenPattern(String),
    #[error("thread id contains disallowed character {0:?}")]
    InvalidThreadIdChar(char),
}

/// Validate and escape outbound text for the native chat-send action.
/// Escapes backslash, quote, newline, tab, CR in that order.
pub fn sanitize_text(text: &str) -> Result<String, SanitizeError> {
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(SanitizeError::TooLong);
    }
    let lower = text.to_lowercase();
    for pattern in INJECTION_BLACKLIST {
        if lower.contains(pattern) {
            return Err(SanitizeError::ForbiddenPattern((*pattern).to_owned()));
        }
    }
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    Ok(escaped)
}

/// Validate a thread id contains only the allowed character set.
pub fn validate_thread_id(thread_id: &str) -> Result<(), SanitizeError> {
    for c in thread_id.chars() {
        let allowed = c.is_ascii_alphanumeric() || matches!(c, '+' | '@' | '.' | '_' | '-' | ';');
        if !allowed {
            return Err(SanitizeError::InvalidThreadIdChar(c));
        }
    }
    Ok(())
}

/// Direct vs. group is decided by the thread id's opaque prefix shape, not
/// text heuristics: group chat ids carry a `chat` prefix token.
pub fn is_group_thread_id(thread_id: &str) -> bool {
    thread_id.starts_with("chat")
}
