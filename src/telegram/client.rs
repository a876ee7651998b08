//! Telegram Bot API transport

use super::{ChatId, ChatTarget, MessageId};
use crate::template::Keyboard;
use crate::transport::{OutgoingMessage, SentMessage, Transport, TransportError};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// HTTP client for one bot token
pub struct TelegramClient {
    client: Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(token: &str, api_base: Option<&str>) -> Result<Self, TransportError> {
        let base = api_base.unwrap_or(DEFAULT_API_BASE).trim_end_matches('/');
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{base}/bot{token}"),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, TransportError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    TransportError::network(format!("Connection failed: {e}"))
                } else {
                    TransportError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::network(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(classify_error(status, &body));
        }

        let parsed: ApiResponse<T> = serde_json::from_str(&body).map_err(|e| {
            TransportError::unknown(format!("Failed to parse response: {e} - body: {body}"))
        })?;

        match (parsed.ok, parsed.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TransportError::rejected(
                parsed
                    .description
                    .unwrap_or_else(|| format!("{method} returned no result")),
            )),
        }
    }
}

fn classify_error(status: reqwest::StatusCode, body: &str) -> TransportError {
    let description = serde_json::from_str::<ApiResponse<Value>>(body)
        .ok()
        .and_then(|r| r.description)
        .unwrap_or_else(|| body.to_string());

    match status.as_u16() {
        401 | 403 => TransportError::auth(format!("Authentication failed: {description}")),
        429 => {
            let mut err = TransportError::rate_limited(format!("Rate limited: {description}"));
            if let Some(seconds) = serde_json::from_str::<ApiResponse<Value>>(body)
                .ok()
                .and_then(|r| r.parameters)
                .and_then(|p| p.retry_after)
            {
                err = err.with_retry_after(Duration::from_secs(seconds));
            }
            err
        }
        400 | 404 => TransportError::rejected(format!("Rejected: {description}")),
        500..=599 => TransportError::network(format!("Server error: {description}")),
        _ => TransportError::unknown(format!("HTTP {status}: {description}")),
    }
}

/// Bot API inline keyboard JSON
fn reply_markup(keyboard: &Keyboard) -> Value {
    let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| InlineKeyboardButton {
                    text: b.label.clone(),
                    callback_data: b.payload.clone(),
                })
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

fn into_sent(message: ApiMessage, keyboard: Keyboard) -> SentMessage {
    SentMessage {
        message_id: message.message_id,
        chat_id: message.chat.id,
        text: message.text.unwrap_or_default(),
        entities: message.entities,
        keyboard,
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, TransportError> {
        let mut body = json!({
            "chat_id": message.chat_id,
            "text": message.text,
            "reply_markup": reply_markup(&message.keyboard),
        });
        if let Some(reply_to) = message.reply_to {
            body["reply_to_message_id"] = json!(reply_to);
        }

        let sent: ApiMessage = self.call("sendMessage", &body).await?;
        Ok(into_sent(sent, message.keyboard.clone()))
    }

    async fn forward_message(
        &self,
        to: &ChatTarget,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<SentMessage, TransportError> {
        let body = json!({
            "chat_id": to,
            "from_chat_id": from,
            "message_id": message_id,
        });
        let sent: ApiMessage = self.call("forwardMessage", &body).await?;
        Ok(into_sent(sent, Vec::new()))
    }

    async fn edit_message_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        entities: Option<&Value>,
        keyboard: &Keyboard,
    ) -> Result<(), TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "reply_markup": reply_markup(keyboard),
        });
        if let Some(entities) = entities {
            body["entities"] = entities.clone();
        }
        // Returns the edited message, or `true` for inline messages
        let _: Value = self.call("editMessageText", &body).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), TransportError> {
        let body = json!({ "chat_id": chat_id, "message_id": message_id });
        let _: bool = self.call("deleteMessage", &body).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        let body = json!({ "callback_query_id": callback_id });
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    async fn leave_chat(&self, chat_id: ChatId) -> Result<(), TransportError> {
        let body = json!({ "chat_id": chat_id });
        let _: bool = self.call("leaveChat", &body).await?;
        Ok(())
    }
}

// Bot API wire types

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: MessageId,
    chat: ApiChat,
    text: Option<String>,
    entities: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiChat {
    id: ChatId,
}

#[derive(Debug, Serialize)]
struct InlineKeyboardButton {
    text: String,
    callback_data: String,
}
