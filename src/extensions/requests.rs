//! Request lifecycle operations
//!
//! A Request is created by a form submission, merged on duplicate keys,
//! discussed on an admin thread and a user thread, and finally cancelled by
//! the user or closed by an admin.

use super::threads::{send_user_thread, single_button, update_admin_thread, Author, ThreadEntry};
use super::{ExtensionContext, ExtensionError, ExtensionFunction, ExtensionOp};
use crate::db::Record;
use crate::runtime::RecordKey;
use crate::telegram::last_line;
use crate::template;
use crate::transport::OutgoingMessage;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;

/// Implementation of one lifecycle operation
#[derive(Debug, Clone, Copy)]
pub struct RequestLifecycle {
    op: ExtensionOp,
}

impl RequestLifecycle {
    pub fn new(op: ExtensionOp) -> Self {
        Self { op }
    }
}

#[async_trait]
impl ExtensionFunction for RequestLifecycle {
    async fn call(&self, ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
        match self.op {
            ExtensionOp::Init => init(ctx).await,
            ExtensionOp::SubmitForm => submit_form(ctx).await,
            ExtensionOp::AppendUserForm => append_user_form(ctx).await,
            ExtensionOp::CancelRequest => cancel_request(ctx).await,
            ExtensionOp::AppendAdminForm => append_admin_form(ctx).await,
            ExtensionOp::CloseRequest => close_request(ctx).await,
            ExtensionOp::ValidateForwardTemplate => validate_forward_template(ctx).await,
            ExtensionOp::CheckDuplicate => check_duplicate(ctx),
            ExtensionOp::ConfirmDuplicateUpdate => confirm_duplicate_update(ctx).await,
            ExtensionOp::UpdateDuplicate => update_duplicate(ctx),
        }
    }
}

fn record_from(data: &BTreeMap<String, String>) -> Record {
    data.iter()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect()
}

/// Mirror a new request row; failures are logged only
async fn mirror_append(ctx: &ExtensionContext<'_>, request_id: &str, row: Record) {
    let sheet = &ctx.services.record_sheet;
    if let Err(e) = ctx.services.records.append_record(sheet, &row).await {
        tracing::error!(request_id, sheet = %sheet, error = %e, "Failed to append request record");
    }
}

/// Patch the mirrored row of a request; failures are logged only
pub(super) async fn mirror_update(ctx: &ExtensionContext<'_>, request_id: &str, patch: Record) {
    let sheet = &ctx.services.record_sheet;
    let key = RecordKey::new("request_id", request_id);
    if let Err(e) = ctx.services.records.update_record(sheet, &key, &patch).await {
        tracing::error!(request_id, sheet = %sheet, error = %e, "Failed to update request record");
    }
}

/// Request id on the last line of the message being replied to
fn replied_request_id(ctx: &ExtensionContext<'_>, op: ExtensionOp) -> Result<String, ExtensionError> {
    ctx.update
        .reply_to_text()
        .and_then(last_line)
        .map(str::to_string)
        .ok_or(ExtensionError::MissingRequestId(op))
}

/// Request id on the last line of the message whose button was pressed
fn callback_request_id(ctx: &ExtensionContext<'_>, op: ExtensionOp) -> Result<String, ExtensionError> {
    ctx.update
        .callback_message_text()
        .and_then(last_line)
        .map(str::to_string)
        .ok_or(ExtensionError::MissingRequestId(op))
}

fn entry<'a>(ctx: &ExtensionContext<'_>, body: &'a str, author: Author) -> ThreadEntry<'a> {
    ThreadEntry {
        body,
        author,
        date_ms: ctx.update.date_ms(),
    }
}

async fn init(ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
    ctx.services
        .records
        .init(&ctx.services.record_sheet, &ctx.definition.requests.record_headers)
        .await?;
    Ok(None)
}

async fn submit_form(ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
    let settings = &ctx.definition.requests;
    let chat_id = ctx.session.chat_id();
    let forwarded = ctx
        .session
        .store
        .get(&settings.forward_slot)
        .filter(|f| !f.is_empty())
        .map(str::to_string);

    let (submission, data, tracked) = {
        let mut global = ctx.global.lock().unwrap();
        let submission = global.submit(
            &settings.dedup_slot,
            &settings.forward_slot,
            &ctx.session.store,
            chat_id,
        );
        let data = global
            .request(&submission.request_id)
            .map(|r| r.data.clone())
            .unwrap_or_default();
        (submission, data, global.len())
    };
    let request_id = submission.request_id.as_str();
    tracing::info!(
        request_id,
        chat_id,
        created = submission.created,
        tracked,
        "Form submitted"
    );

    let now = Utc::now().to_rfc3339();
    let mut row = record_from(&data);
    if submission.created {
        row.insert("request_id".into(), Value::from(request_id));
        row.insert("creation_time".into(), Value::from(now));
        mirror_append(ctx, request_id, row).await;
    } else {
        row.insert("last_update_time".into(), Value::from(now));
        mirror_update(ctx, request_id, row).await;
    }

    let body = match &forwarded {
        Some(text) => text.clone(),
        None => template::render(&settings.summary, &ctx.session.store, "N/A"),
    };
    let messages = &settings.messages;
    update_admin_thread(
        ctx,
        request_id,
        entry(ctx, &body, Author::SentBy(ctx.update.sender_name())),
        single_button(&messages.close_button),
    )
    .await?;
    send_user_thread(
        ctx,
        request_id,
        chat_id,
        None,
        &messages.waiting_for_response,
        single_button(&messages.cancel_button),
    )
    .await?;

    Ok(None)
}

async fn append_user_form(ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
    let request_id = replied_request_id(ctx, ExtensionOp::AppendUserForm)?;
    let chat_id = ctx.session.chat_id();
    let reply_to = ctx.update.message_id();
    let messages = &ctx.definition.requests.messages;

    let active = {
        let global = ctx.global.lock().unwrap();
        let request = global
            .request(&request_id)
            .ok_or_else(|| ExtensionError::UnknownRequest(request_id.clone()))?;
        request.is_active_for(chat_id)
    };

    if !active {
        send_user_thread(ctx, &request_id, chat_id, reply_to, &messages.request_closed, Vec::new())
            .await?;
        return Ok(None);
    }

    let body = ctx.update.message_text().unwrap_or_default();
    update_admin_thread(
        ctx,
        &request_id,
        entry(ctx, body, Author::SentBy(ctx.update.sender_name())),
        single_button(&messages.close_button),
    )
    .await?;
    send_user_thread(
        ctx,
        &request_id,
        chat_id,
        reply_to,
        &messages.waiting_for_response,
        single_button(&messages.cancel_button),
    )
    .await?;

    Ok(None)
}

async fn cancel_request(ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
    let request_id = callback_request_id(ctx, ExtensionOp::CancelRequest)?;
    let chat_id = ctx.session.chat_id();
    let reply_to = ctx.update.callback_message().map(|m| m.message_id);
    let messages = &ctx.definition.requests.messages;

    // None when the chat may no longer cancel; otherwise whether this closed it
    let outcome = {
        let mut global = ctx.global.lock().unwrap();
        let request = global
            .request_mut(&request_id)
            .ok_or_else(|| ExtensionError::UnknownRequest(request_id.clone()))?;
        if request.is_open() && request.is_active_for(chat_id) {
            Some(request.remove_active_chat(chat_id))
        } else {
            None
        }
    };

    let Some(closed) = outcome else {
        send_user_thread(ctx, &request_id, chat_id, reply_to, &messages.request_closed, Vec::new())
            .await?;
        return Ok(None);
    };
    tracing::info!(request_id = %request_id, chat_id, closed, "User cancelled request");

    let keyboard = if closed {
        Vec::new()
    } else {
        single_button(&messages.close_button)
    };
    update_admin_thread(
        ctx,
        &request_id,
        entry(ctx, &messages.user_cancelled, Author::SentBy(ctx.update.sender_name())),
        keyboard,
    )
    .await?;
    send_user_thread(ctx, &request_id, chat_id, reply_to, &messages.request_cancelled, Vec::new())
        .await?;

    Ok(None)
}

async fn append_admin_form(ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
    let ctx = &*ctx;
    let request_id = replied_request_id(ctx, ExtensionOp::AppendAdminForm)?;
    let admin = ctx.update.sender_name();
    let body = ctx.update.message_text().unwrap_or_default();
    let messages = &ctx.definition.requests.messages;

    let active_chats = {
        let global = ctx.global.lock().unwrap();
        global
            .request(&request_id)
            .ok_or_else(|| ExtensionError::UnknownRequest(request_id.clone()))?
            .active_chats
            .clone()
    };

    if active_chats.is_empty() {
        let note = format!("{}\n\n{body}", messages.admin_ignored);
        update_admin_thread(
            ctx,
            &request_id,
            entry(ctx, &note, Author::RepliedBy(admin)),
            Vec::new(),
        )
        .await?;
        return Ok(None);
    }

    update_admin_thread(
        ctx,
        &request_id,
        entry(ctx, body, Author::RepliedBy(admin)),
        single_button(&messages.close_button),
    )
    .await?;

    if let (Some(chat_id), Some(message_id)) = (ctx.update.chat_id(), ctx.update.message_id()) {
        if let Err(e) = ctx.services.transport.delete_message(chat_id, message_id).await {
            tracing::warn!(
                request_id = %request_id,
                error = %e,
                "Failed to delete admin reply; the bot may not be a group admin"
            );
        }
    }

    let sends = active_chats.iter().map(|&chat_id| {
        send_user_thread(
            ctx,
            &request_id,
            chat_id,
            None,
            body,
            single_button(&messages.cancel_button),
        )
    });
    futures::future::join_all(sends)
        .await
        .into_iter()
        .collect::<Result<Vec<()>, _>>()?;

    Ok(None)
}

async fn close_request(ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
    let ctx = &*ctx;
    let messages = &ctx.definition.requests.messages;
    let payload = template::render(
        ctx.update.callback_data().unwrap_or_default(),
        &ctx.session.store,
        "",
    );
    if payload != messages.close_button {
        return Ok(None);
    }

    let request_id = callback_request_id(ctx, ExtensionOp::CloseRequest)?;
    let admin = ctx.update.sender_name();

    // None when there was nothing left to close
    let former_chats = {
        let mut global = ctx.global.lock().unwrap();
        let request = global
            .request_mut(&request_id)
            .ok_or_else(|| ExtensionError::UnknownRequest(request_id.clone()))?;
        if request.is_open() && !request.active_chats.is_empty() {
            Some(request.close())
        } else {
            None
        }
    };

    let Some(former_chats) = former_chats else {
        update_admin_thread(
            ctx,
            &request_id,
            entry(ctx, &messages.already_closed, Author::RepliedBy(admin)),
            Vec::new(),
        )
        .await?;
        return Ok(None);
    };
    tracing::info!(request_id = %request_id, admin = %admin, "Admin closed request");

    let note = format!("< {admin} closed the request >");
    update_admin_thread(
        ctx,
        &request_id,
        entry(ctx, &note, Author::RepliedBy(admin.clone())),
        Vec::new(),
    )
    .await?;

    let sends = former_chats.iter().map(|&chat_id| {
        send_user_thread(ctx, &request_id, chat_id, None, &messages.closed_by_admin, Vec::new())
    });
    futures::future::join_all(sends)
        .await
        .into_iter()
        .collect::<Result<Vec<()>, _>>()?;

    Ok(None)
}

async fn validate_forward_template(
    ctx: &mut ExtensionContext<'_>,
) -> Result<Option<String>, ExtensionError> {
    let settings = &ctx.definition.requests;
    let text = ctx.update.message_text().unwrap_or_default();

    if let Some(key) = settings.extract_key(text) {
        ctx.session.store.capture(settings.dedup_slot.clone(), key);
        return Ok(None);
    }

    let chat_id = ctx.session.chat_id();
    let (text, keyboard) = settings.messages.invalid_template.render(&ctx.session.store, "");
    ctx.services
        .transport
        .send_message(&OutgoingMessage::new(chat_id, text).with_keyboard(keyboard))
        .await?;
    Err(ExtensionError::Rejected(
        "forwarded text carries no request key".to_string(),
    ))
}

fn check_duplicate(ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
    let settings = &ctx.definition.requests;
    let key = ctx
        .session
        .store
        .get(&settings.dedup_slot)
        .unwrap_or_default()
        .to_string();

    if !settings.is_valid_key(&key) {
        ctx.session.store.capture(settings.dedup_slot.clone(), "");
        return Ok(None);
    }

    let exists = ctx
        .global
        .lock()
        .unwrap()
        .find_by_key(&settings.dedup_slot, &key)
        .is_some();
    Ok(if exists {
        settings.duplicate_state.clone()
    } else {
        None
    })
}

async fn confirm_duplicate_update(
    ctx: &mut ExtensionContext<'_>,
) -> Result<Option<String>, ExtensionError> {
    let settings = &ctx.definition.requests;
    let key = ctx
        .session
        .store
        .get(&settings.dedup_slot)
        .unwrap_or_default()
        .to_string();
    let data = ctx
        .global
        .lock()
        .unwrap()
        .find_by_key(&settings.dedup_slot, &key)
        .map(|r| r.data.clone())
        .ok_or_else(|| ExtensionError::UnknownRequest(key.clone()))?;

    let has_form = data
        .keys()
        .any(|k| *k != settings.dedup_slot && *k != settings.forward_slot);
    let mut text = settings.messages.duplicate_intro.clone();
    if has_form && !settings.summary.is_empty() {
        text.push_str("\n\n");
        text.push_str(&template::render(&settings.summary, &data, "N/A"));
    }
    if let Some(forwarded) = data.get(&settings.forward_slot).filter(|f| !f.is_empty()) {
        text.push_str("\n\n");
        text.push_str(forwarded);
    }
    text.push_str("\n\n");
    text.push_str(&settings.messages.duplicate_question);
    text.push_str(" [[Yes, No]]");

    let keyboard = template::extract_buttons(&text, &ctx.session.store, true);
    let text = template::strip_buttons(&text);
    ctx.services
        .transport
        .send_message(&OutgoingMessage::new(ctx.session.chat_id(), text).with_keyboard(keyboard))
        .await?;
    Ok(None)
}

fn update_duplicate(ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
    let settings = &ctx.definition.requests;
    let forwarded = ctx
        .session
        .store
        .get(&settings.forward_slot)
        .is_some_and(|f| !f.is_empty());
    if forwarded {
        return Ok(settings.forward_state.clone());
    }

    let key = ctx
        .session
        .store
        .get(&settings.dedup_slot)
        .unwrap_or_default()
        .to_string();
    let data = ctx
        .global
        .lock()
        .unwrap()
        .find_by_key(&settings.dedup_slot, &key)
        .map(|r| r.data.clone())
        .ok_or(ExtensionError::UnknownRequest(key))?;

    ctx.session.store.load_snapshot(&data);
    ctx.session.store.capture(settings.forward_slot.clone(), "");
    Ok(None)
}
