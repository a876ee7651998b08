//! Outbound chat transport abstraction
//!
//! The interpreter only talks to the chat platform through [`Transport`];
//! the Telegram client is one implementation, test mocks are another.

mod error;

pub use error::{TransportError, TransportErrorKind};

use crate::telegram::{ChatId, ChatTarget, MessageId};
use crate::template::Keyboard;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A message about to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub keyboard: Keyboard,
    pub reply_to: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn new(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            keyboard: Vec::new(),
            reply_to: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = keyboard;
        self
    }

    pub fn reply_to(mut self, message_id: Option<MessageId>) -> Self {
        self.reply_to = message_id;
        self
    }
}

/// What the platform echoed back for a sent or forwarded message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Value>,
    #[serde(default)]
    pub keyboard: Keyboard,
}

impl SentMessage {
    pub fn has_keyboard(&self) -> bool {
        self.keyboard.iter().any(|row| !row.is_empty())
    }
}

/// Outbound calls to the chat platform. Every call may suspend and fail.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, TransportError>;

    async fn forward_message(
        &self,
        to: &ChatTarget,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<SentMessage, TransportError>;

    async fn edit_message_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        entities: Option<&Value>,
        keyboard: &Keyboard,
    ) -> Result<(), TransportError>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId)
        -> Result<(), TransportError>;

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError>;

    async fn leave_chat(&self, chat_id: ChatId) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, TransportError> {
        (**self).send_message(message).await
    }

    async fn forward_message(
        &self,
        to: &ChatTarget,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<SentMessage, TransportError> {
        (**self).forward_message(to, from, message_id).await
    }

    async fn edit_message_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        entities: Option<&Value>,
        keyboard: &Keyboard,
    ) -> Result<(), TransportError> {
        (**self)
            .edit_message_text(chat_id, message_id, text, entities, keyboard)
            .await
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), TransportError> {
        (**self).delete_message(chat_id, message_id).await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        (**self).answer_callback(callback_id).await
    }

    async fn leave_chat(&self, chat_id: ChatId) -> Result<(), TransportError> {
        (**self).leave_chat(chat_id).await
    }
}

/// Logging wrapper for transports
pub struct LoggingTransport {
    inner: Arc<dyn Transport>,
}

impl LoggingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self { inner }
    }

    fn log<T>(
        method: &str,
        chat: impl fmt::Display,
        start: std::time::Instant,
        result: &Result<T, TransportError>,
    ) {
        let duration = start.elapsed();
        match result {
            Ok(_) => {
                tracing::debug!(
                    method,
                    chat_id = %chat,
                    duration_ms = %duration.as_millis(),
                    "Transport call completed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    method,
                    chat_id = %chat,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    retry_after_secs = e.retry_after.map(|d| d.as_secs()),
                    "Transport call failed"
                );
            }
        }
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, TransportError> {
        let start = std::time::Instant::now();
        let result = self.inner.send_message(message).await;
        Self::log("sendMessage", message.chat_id, start, &result);
        result
    }

    async fn forward_message(
        &self,
        to: &ChatTarget,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<SentMessage, TransportError> {
        let start = std::time::Instant::now();
        let result = self.inner.forward_message(to, from, message_id).await;
        Self::log("forwardMessage", to, start, &result);
        result
    }

    async fn edit_message_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        entities: Option<&Value>,
        keyboard: &Keyboard,
    ) -> Result<(), TransportError> {
        let start = std::time::Instant::now();
        let result = self
            .inner
            .edit_message_text(chat_id, message_id, text, entities, keyboard)
            .await;
        Self::log("editMessageText", chat_id, start, &result);
        result
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), TransportError> {
        let start = std::time::Instant::now();
        let result = self.inner.delete_message(chat_id, message_id).await;
        Self::log("deleteMessage", chat_id, start, &result);
        result
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        let start = std::time::Instant::now();
        let result = self.inner.answer_callback(callback_id).await;
        Self::log("answerCallbackQuery", 0, start, &result);
        result
    }

    async fn leave_chat(&self, chat_id: ChatId) -> Result<(), TransportError> {
        let start = std::time::Instant::now();
        let result = self.inner.leave_chat(chat_id).await;
        Self::log("leaveChat", chat_id, start, &result);
        result
    }
}
