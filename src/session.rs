//! Chat sessions and their slot stores
//!
//! Sessions are created lazily on the first update for a (bot, chat) pair
//! and live for the lifetime of the process.

mod global;

pub use global::{GlobalStore, Request, RequestStatus, SharedGlobalStore, Submission};

use crate::telegram::ChatId;
use crate::template::SlotLookup;
use crate::transport::SentMessage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Path prefix that addresses the durable cache from templates
pub const CACHE_PREFIX: &str = "cache.";

/// Named slot values for one chat.
///
/// Live slots are cleared by `reset_slots` states and `restart`; the cache
/// keeps the last captured value per slot and is only ever overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotStore {
    slots: BTreeMap<String, String>,
    cache: BTreeMap<String, String>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.slots.get(name).map(String::as_str)
    }

    pub fn cached(&self, name: &str) -> Option<&str> {
        self.cache.get(name).map(String::as_str)
    }

    /// Set a live slot without touching the cache
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.slots.insert(name.into(), value.into());
    }

    /// Set a live slot and remember it in the cache
    pub fn capture(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        self.cache.insert(name.clone(), value.clone());
        self.slots.insert(name, value);
    }

    /// Drop every live slot; the cache survives
    pub fn clear_slots(&mut self) {
        self.slots.clear();
    }

    /// Replace live slots and cache with a snapshot
    pub fn load_snapshot(&mut self, data: &BTreeMap<String, String>) {
        self.slots.clone_from(data);
        self.cache.clone_from(data);
    }

    pub fn slots(&self) -> &BTreeMap<String, String> {
        &self.slots
    }
}

impl SlotLookup for SlotStore {
    fn slot(&self, path: &str) -> Option<&str> {
        match path.strip_prefix(CACHE_PREFIX) {
            Some(name) => self.cached(name),
            None => self.get(path),
        }
    }
}

/// Identity of a chat session: the bot it talks to and the chat id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub bot: String,
    pub chat_id: ChatId,
}

impl SessionKey {
    pub fn new(bot: impl Into<String>, chat_id: ChatId) -> Self {
        Self {
            bot: bot.into(),
            chat_id,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bot, self.chat_id)
    }
}

/// Per-chat conversation state
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub key: SessionKey,
    /// Name of the state the chat is waiting in; `None` until the first update
    pub current_state: Option<String>,
    pub store: SlotStore,
    /// Last message sent to this chat, used to retract stale keyboards
    pub last_message_sent: Option<SentMessage>,
}

impl ChatSession {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            current_state: None,
            store: SlotStore::new(),
            last_message_sent: None,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.key.chat_id
    }
}

pub type SharedSession = Arc<tokio::sync::Mutex<ChatSession>>;

/// Table of all chat sessions in the process
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionKey, SharedSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for a chat, creating an empty one on first use
    pub fn get_or_create(&self, key: &SessionKey) -> SharedSession {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(session = %key, "Creating chat session");
                Arc::new(tokio::sync::Mutex::new(ChatSession::new(key.clone())))
            })
            .clone()
    }

    pub fn get(&self, key: &SessionKey) -> Option<SharedSession> {
        self.sessions.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
