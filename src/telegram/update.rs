//! Inbound update payloads
//!
//! Only the fields the interpreter and the request lifecycle read are
//! modelled; everything else in the payload is ignored.

use super::{ChatId, MessageId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<CallbackQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_chat_member: Option<ChatMemberUpdated>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_post: Option<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl User {
    /// `@username` when available, otherwise first and last name
    pub fn display_name(&self) -> String {
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            return format!("@{username}");
        }
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(rename = "type", default)]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    /// Unix time in seconds
    #[serde(default)]
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Formatting entities, passed back verbatim when a message is edited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_chat_members: Option<Vec<User>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMember {
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub from: User,
    pub new_chat_member: ChatMember,
}

impl Update {
    /// The chat this update belongs to
    pub fn chat(&self) -> Option<&Chat> {
        self.message
            .as_ref()
            .map(|m| &m.chat)
            .or_else(|| self.my_chat_member.as_ref().map(|m| &m.chat))
            .or_else(|| self.channel_post.as_ref().map(|m| &m.chat))
            .or_else(|| {
                self.callback_query
                    .as_ref()
                    .and_then(|q| q.message.as_ref())
                    .map(|m| &m.chat)
            })
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.chat().map(|c| c.id)
    }

    pub fn chat_kind(&self) -> ChatKind {
        self.chat().map(|c| c.kind).unwrap_or_default()
    }

    /// The user who caused this update
    pub fn from(&self) -> Option<&User> {
        self.message
            .as_ref()
            .and_then(|m| m.from.as_ref())
            .or_else(|| self.callback_query.as_ref().map(|q| &q.from))
            .or_else(|| self.my_chat_member.as_ref().map(|m| &m.from))
    }

    pub fn sender_name(&self) -> String {
        self.from().map(User::display_name).unwrap_or_default()
    }

    pub fn message_text(&self) -> Option<&str> {
        self.message.as_ref().and_then(|m| m.text.as_deref())
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.message.as_ref().map(|m| m.message_id)
    }

    /// Unix time of the update in milliseconds
    pub fn date_ms(&self) -> i64 {
        self.message
            .as_ref()
            .or_else(|| {
                self.callback_query
                    .as_ref()
                    .and_then(|q| q.message.as_ref())
            })
            .map_or(0, |m| m.date * 1000)
    }

    pub fn is_callback_query(&self) -> bool {
        self.callback_query.is_some()
    }

    pub fn callback_id(&self) -> Option<&str> {
        self.callback_query.as_ref().map(|q| q.id.as_str())
    }

    pub fn callback_data(&self) -> Option<&str> {
        self.callback_query.as_ref().and_then(|q| q.data.as_deref())
    }

    /// The bot message the pressed button was attached to
    pub fn callback_message(&self) -> Option<&Message> {
        self.callback_query.as_ref().and_then(|q| q.message.as_ref())
    }

    pub fn callback_message_text(&self) -> Option<&str> {
        self.callback_message().and_then(|m| m.text.as_deref())
    }

    pub fn reply_to(&self) -> Option<&Message> {
        self.message
            .as_ref()
            .and_then(|m| m.reply_to_message.as_deref())
    }

    pub fn reply_to_text(&self) -> Option<&str> {
        self.reply_to().and_then(|m| m.text.as_deref())
    }

    pub fn is_reply_to_bot(&self) -> bool {
        self.reply_to()
            .and_then(|m| m.from.as_ref())
            .is_some_and(|u| u.is_bot)
    }

    /// New membership status of the bot in this chat, if changed
    pub fn member_status(&self) -> Option<&str> {
        self.my_chat_member
            .as_ref()
            .map(|m| m.new_chat_member.status.as_str())
    }

    pub fn new_members(&self) -> &[User] {
        self.message
            .as_ref()
            .and_then(|m| m.new_chat_members.as_deref())
            .unwrap_or_default()
    }
}

/// Request ids travel as the last line of thread messages
pub fn last_line(text: &str) -> Option<&str> {
    text.lines().last().map(str::trim).filter(|l| !l.is_empty())
}
