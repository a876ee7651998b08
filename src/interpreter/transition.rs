//! Pure resolution helpers
//!
//! Nothing in here performs I/O, so the matching rules can be tested in
//! isolation from the action loop.

use crate::workflow::{State, WILDCARD};
use regex::Regex;
use std::sync::LazyLock;

/// A leading slash command such as `/start`
static COMMAND_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[a-z]+").expect("command pattern is valid"));

/// Command trigger at the start of a response, if any
pub fn match_command(response: &str) -> Option<&str> {
    COMMAND_PATTERN.find(response).map(|m| m.as_str())
}

/// Next state for a response: an exact transition wins over the wildcard
pub fn resolve_transition<'a>(state: &'a State, response: &str) -> Option<&'a str> {
    state
        .transitions
        .iter()
        .find(|t| t.on == response)
        .or_else(|| state.transitions.iter().find(|t| t.on == WILDCARD))
        .map(|t| t.to.as_str())
}

/// The user's response: message text first, then the rendered callback payload
pub fn user_response(message_text: Option<&str>, callback_payload: Option<&str>) -> String {
    message_text
        .filter(|t| !t.is_empty())
        .or(callback_payload)
        .unwrap_or_default()
        .to_string()
}
