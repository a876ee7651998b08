//! Admin and user request threads
//!
//! Both kinds of thread message end with the request id on its own line,
//! which is how replies and button presses are routed back to a Request.
//! The admin thread is re-posted on every update and the previous post is
//! deleted, so the latest state is always at the bottom of the group.

use super::{ExtensionContext, ExtensionError};
use crate::db::Record;
use crate::session::RequestStatus;
use crate::telegram::{ChatId, MessageId};
use crate::template::{self, Button, Keyboard};
use crate::transport::OutgoingMessage;
use crate::workflow::RequestSettings;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Who added an entry to the admin thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Author {
    SentBy(String),
    RepliedBy(String),
}

/// One entry appended to the admin thread
#[derive(Debug, Clone)]
pub(super) struct ThreadEntry<'a> {
    pub body: &'a str,
    pub author: Author,
    pub date_ms: i64,
}

pub(super) fn single_button(label: &str) -> Keyboard {
    vec![vec![Button::new(label, label)]]
}

fn format_date(date_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(date_ms)
        .map(|d| d.format("%d/%m/%Y %H:%M UTC").to_string())
        .unwrap_or_default()
}

fn status_line(status: RequestStatus) -> String {
    format!("STATUS: {}", status.as_str().to_uppercase())
}

fn author_line(entry: &ThreadEntry<'_>) -> String {
    let (verb, name) = match &entry.author {
        Author::SentBy(name) => ("Sent", name),
        Author::RepliedBy(name) => ("Replied", name),
    };
    format!("{verb} by {name} on {}", format_date(entry.date_ms))
}

/// Header lines whose slots are all present in `data`
fn render_header(template: &str, data: &BTreeMap<String, String>) -> String {
    template
        .lines()
        .filter(|line| {
            template::slot_names(line)
                .iter()
                .all(|name| data.get(*name).is_some_and(|v| !v.is_empty()))
        })
        .map(|line| template::render(line, data, ""))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Text of the next admin-thread post.
///
/// The first post carries the header and reply hint; later posts rewrite
/// the status line and insert the new entry right below it.
pub(super) fn admin_thread_text(
    request_id: &str,
    status: RequestStatus,
    data: &BTreeMap<String, String>,
    previous: &str,
    entry: &ThreadEntry<'_>,
    settings: &RequestSettings,
) -> String {
    let status = status_line(status);

    if previous.is_empty() {
        let mut header = render_header(&settings.thread_header, data);
        if !header.is_empty() {
            header.insert(0, '\n');
        }
        return format!(
            "{status}\n\n{}{header}\n\n{}\n\n{}\n\n{request_id}",
            author_line(entry),
            entry.body,
            settings.messages.admin_reply_hint
        );
    }

    // Only the first line is our header; later lines may be message bodies
    let earlier = match previous.split_once('\n') {
        Some((first, rest)) if first.starts_with("STATUS") => rest,
        None if previous.starts_with("STATUS") => "",
        _ => previous,
    };
    let mut text = format!("{status}\n\n{}\n\n{}", author_line(entry), entry.body);
    if !earlier.is_empty() {
        if !earlier.starts_with('\n') {
            text.push('\n');
        }
        text.push('\n');
        text.push_str(earlier);
    }
    text
}

/// Text of a message on a user's request thread
pub(super) fn user_thread_text(
    request_id: &str,
    data: &BTreeMap<String, String>,
    body: &str,
    accepts_replies: bool,
    settings: &RequestSettings,
) -> String {
    let header = render_header(&settings.thread_header, data);
    let mut parts = Vec::new();
    if !header.is_empty() {
        parts.push(header);
    }
    if accepts_replies {
        parts.push(format!("{body}\n\n{}", settings.messages.user_reply_hint));
    } else {
        parts.push(body.to_string());
    }
    parts.push(request_id.to_string());
    parts.join("\n\n")
}

/// Re-post the admin thread of a request with a new entry
pub(super) async fn update_admin_thread(
    ctx: &ExtensionContext<'_>,
    request_id: &str,
    entry: ThreadEntry<'_>,
    keyboard: Keyboard,
) -> Result<(), ExtensionError> {
    let admin_chat = ctx.services.admin_chat_id;
    let (status, data, previous_id, previous_text) = {
        let global = ctx.global.lock().unwrap();
        let request = global
            .request(request_id)
            .ok_or_else(|| ExtensionError::UnknownRequest(request_id.to_string()))?;
        (
            request.status,
            request.data.clone(),
            request.admin_thread_message_id,
            request.admin_thread_message_text.clone(),
        )
    };

    let text = admin_thread_text(
        request_id,
        status,
        &data,
        &previous_text,
        &entry,
        &ctx.definition.requests,
    );
    let sent = ctx
        .services
        .transport
        .send_message(&OutgoingMessage::new(admin_chat, text.clone()).with_keyboard(keyboard))
        .await?;

    let active_chats = {
        let mut global = ctx.global.lock().unwrap();
        match global.request_mut(request_id) {
            Some(request) => {
                request.admin_thread_message_id = Some(sent.message_id);
                request.admin_thread_message_text.clone_from(&text);
                request.active_chats.clone()
            }
            None => Vec::new(),
        }
    };

    if let Some(previous_id) = previous_id {
        if let Err(e) = ctx
            .services
            .transport
            .delete_message(admin_chat, previous_id)
            .await
        {
            tracing::warn!(request_id, error = %e, "Failed to delete previous admin thread post");
        }
    }

    let mut patch = Record::new();
    patch.insert("status".into(), Value::from(status.as_str()));
    patch.insert("last_update_time".into(), Value::from(Utc::now().to_rfc3339()));
    patch.insert("admin_thread_message_id".into(), Value::from(sent.message_id));
    patch.insert("admin_thread_message_text".into(), Value::from(text));
    patch.insert(
        "active_chats".into(),
        Value::from(
            active_chats
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        ),
    );
    super::requests::mirror_update(ctx, request_id, patch).await;

    Ok(())
}

/// Send a message on a user's request thread
pub(super) async fn send_user_thread(
    ctx: &ExtensionContext<'_>,
    request_id: &str,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    body: &str,
    keyboard: Keyboard,
) -> Result<(), ExtensionError> {
    let (data, accepts_replies) = {
        let global = ctx.global.lock().unwrap();
        let request = global
            .request(request_id)
            .ok_or_else(|| ExtensionError::UnknownRequest(request_id.to_string()))?;
        (
            request.data.clone(),
            request.is_open() && request.is_active_for(chat_id),
        )
    };

    let text = user_thread_text(
        request_id,
        &data,
        body,
        accepts_replies,
        &ctx.definition.requests,
    );
    ctx.services
        .transport
        .send_message(
            &OutgoingMessage::new(chat_id, text)
                .with_keyboard(keyboard)
                .reply_to(reply_to),
        )
        .await?;
    Ok(())
}
