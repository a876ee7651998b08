//! Telegram Bot API integration
//!
//! Inbound update payloads and the HTTP transport used to talk back.

mod client;
mod update;

pub use client::TelegramClient;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
pub use update::{
    last_line, CallbackQuery, Chat, ChatKind, ChatMember, ChatMemberUpdated, Message, Update,
    User,
};

/// Chat identifier as used by the Bot API
pub type ChatId = i64;

/// Message identifier, unique within a chat
pub type MessageId = i64;

/// Where a message goes: a numeric chat id or a public `@username`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ChatTarget {
    Id(ChatId),
    Username(String),
}

#[derive(Debug, Error)]
#[error("invalid chat target `{0}`")]
pub struct InvalidChatTarget(String);

impl FromStr for ChatTarget {
    type Err = InvalidChatTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = s.parse() {
            return Ok(Self::Id(id));
        }
        let is_username = s.strip_prefix('@').is_some_and(|name| {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
        if is_username {
            Ok(Self::Username(s.to_string()))
        } else {
            Err(InvalidChatTarget(s.to_string()))
        }
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Username(name) => f.write_str(name),
        }
    }
}
