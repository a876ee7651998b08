//! Group handling and request lifecycle settings

use super::{Action, Prompt};
use crate::telegram::ChatId;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// An action hook in the group section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionHook {
    pub action: Action,
}

/// How the bot behaves in group chats
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    /// Group whose messages are handled; the admin group when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<ChatId>,
    /// Runs when a group message replies to a bot message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_bot: Option<ActionHook>,
    /// Runs for button presses in the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<ActionHook>,
}

impl GroupSettings {
    pub fn allows(&self, chat_id: ChatId, admin_chat_id: ChatId) -> bool {
        self.allow.unwrap_or(admin_chat_id) == chat_id
    }
}

/// Request lifecycle configuration used by the request extension operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Slot holding the deduplication key
    pub dedup_slot: String,
    /// A key must fully match this to be looked up
    pub dedup_pattern: String,
    /// Finds the key inside forwarded free text
    pub dedup_extract: String,
    /// Slot holding forwarded free text
    pub forward_slot: String,
    /// Returned by `checkDuplicate` when the key is already known
    pub duplicate_state: Option<String>,
    /// Returned by `updateDuplicate` for forwarded submissions
    pub forward_state: Option<String>,
    /// Admin-thread summary of a form submission
    pub summary: String,
    /// Header lines shown above thread messages; lines with missing slots are dropped
    pub thread_header: String,
    /// Columns of the record sheet
    pub record_headers: Vec<String>,
    pub messages: RequestMessages,
    #[serde(skip)]
    compiled: Option<CompiledPatterns>,
}

#[derive(Debug, Clone)]
struct CompiledPatterns {
    dedup: Regex,
    extract: Regex,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            dedup_slot: "reference_id".to_string(),
            dedup_pattern: r"\w+".to_string(),
            dedup_extract: r"\w+".to_string(),
            forward_slot: "forward_message".to_string(),
            duplicate_state: None,
            forward_state: None,
            summary: String::new(),
            thread_header: "Reference: {reference_id}".to_string(),
            record_headers: Vec::new(),
            messages: RequestMessages::default(),
            compiled: None,
        }
    }
}

impl PartialEq for RequestSettings {
    fn eq(&self, other: &Self) -> bool {
        self.dedup_slot == other.dedup_slot
            && self.dedup_pattern == other.dedup_pattern
            && self.dedup_extract == other.dedup_extract
            && self.forward_slot == other.forward_slot
            && self.duplicate_state == other.duplicate_state
            && self.forward_state == other.forward_state
            && self.summary == other.summary
            && self.thread_header == other.thread_header
            && self.record_headers == other.record_headers
            && self.messages == other.messages
    }
}

impl RequestSettings {
    pub(super) fn compile(&mut self) -> Result<(), regex::Error> {
        self.compiled = Some(CompiledPatterns {
            dedup: Regex::new(&format!("^(?:{})$", self.dedup_pattern))?,
            extract: Regex::new(&self.dedup_extract)?,
        });
        Ok(())
    }

    /// Whether a key is well-formed
    pub fn is_valid_key(&self, key: &str) -> bool {
        match &self.compiled {
            Some(patterns) => patterns.dedup.is_match(key),
            None => !key.is_empty(),
        }
    }

    /// Find a key inside free text
    pub fn extract_key<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.compiled
            .as_ref()
            .and_then(|patterns| patterns.extract.find(text))
            .map(|m| m.as_str())
    }
}

/// User and admin facing texts of the request lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestMessages {
    pub waiting_for_response: String,
    pub request_closed: String,
    pub request_cancelled: String,
    pub closed_by_admin: String,
    pub already_closed: String,
    pub user_cancelled: String,
    pub admin_ignored: String,
    pub user_reply_hint: String,
    pub admin_reply_hint: String,
    pub invalid_template: Prompt,
    pub duplicate_intro: String,
    pub duplicate_question: String,
    pub close_button: String,
    pub cancel_button: String,
}

impl Default for RequestMessages {
    fn default() -> Self {
        Self {
            waiting_for_response: "Your message has been recorded. We will get back to you here as soon as there is an update.".to_string(),
            request_closed: "This request is closed. Submit a new request with the same reference to re-open it.".to_string(),
            request_cancelled: "Your request has been successfully cancelled.".to_string(),
            closed_by_admin: "Your request has been closed.".to_string(),
            already_closed: "This request has already been closed.".to_string(),
            user_cancelled: "< User cancelled the request >".to_string(),
            admin_ignored: "This request is closed and the below message has been ignored:".to_string(),
            user_reply_hint: "Reply to this message to send any extra info for this request.".to_string(),
            admin_reply_hint: "Reply to this message to send a message to the user.".to_string(),
            invalid_template: Prompt::new("The template is invalid. Please make sure it carries a reference and send it again.")
                .with_buttons(vec![vec!["Cancel".to_string()]]),
            duplicate_intro: "A request for this reference already exists with the following details:".to_string(),
            duplicate_question: "Do you want to update this request?".to_string(),
            close_button: "Close Request".to_string(),
            cancel_button: "Cancel Request".to_string(),
        }
    }
}
