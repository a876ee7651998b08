//! Conversation interpreter
//!
//! Routes inbound updates by chat type and drives a session through the
//! workflow: command dispatch, validation, slot capture, transition
//! matching and the bounded action loop.

mod actions;
mod transition;


pub use transition::{match_command, resolve_transition, user_response};

use crate::extensions::{ExtensionError, ExtensionOp, ExtensionRegistry};
use crate::runtime::RecordStore;
use crate::session::{ChatSession, SessionKey, SessionStore, SharedGlobalStore};
use crate::telegram::{last_line, ChatId, ChatKind, Update};
use crate::template;
use crate::transport::{OutgoingMessage, Transport, TransportError};
use crate::workflow::{SlotSource, WorkflowDefinition};
use std::sync::Arc;
use thiserror::Error;

/// States a single update may enter before the loop is declared runaway
pub const MAX_STATE_STEPS: usize = 64;

const CHANNEL_NOTICE: &str =
    "This bot is not designed to be used in a channel and will leave the channel shortly.";

/// Outbound collaborators shared by the interpreter and extension functions
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub records: Arc<dyn RecordStore>,
    /// Group where admin threads are posted
    pub admin_chat_id: ChatId,
    /// Sheet that mirrors requests
    pub record_sheet: String,
}

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Entered {limit} states from `{entry}` without settling")]
    StepLimitExceeded { entry: String, limit: usize },
    #[error("Unknown state `{0}`")]
    UnknownState(String),
}

/// Interpreter for one bot identity
pub struct Interpreter {
    bot: String,
    definition: Arc<WorkflowDefinition>,
    registry: ExtensionRegistry,
    services: Services,
    sessions: SessionStore,
    global: SharedGlobalStore,
}

impl Interpreter {
    pub fn new(
        bot: impl Into<String>,
        definition: Arc<WorkflowDefinition>,
        registry: ExtensionRegistry,
        services: Services,
        global: SharedGlobalStore,
    ) -> Self {
        Self {
            bot: bot.into(),
            definition,
            registry,
            services,
            sessions: SessionStore::new(),
            global,
        }
    }

    pub fn bot(&self) -> &str {
        &self.bot
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn global(&self) -> &SharedGlobalStore {
        &self.global
    }

    pub fn session_key(&self, chat_id: ChatId) -> SessionKey {
        SessionKey::new(self.bot.clone(), chat_id)
    }

    /// Run the `init` operation once before serving, if registered
    pub async fn initialize(&self) -> Result<(), ExtensionError> {
        if !self.registry.contains(ExtensionOp::Init) {
            return Ok(());
        }
        let mut session = ChatSession::new(self.session_key(self.services.admin_chat_id));
        self.call_extension(ExtensionOp::Init, &Update::default(), &mut session)
            .await?;
        tracing::info!(bot = %self.bot, "Workflow initialized");
        Ok(())
    }

    /// Process one inbound update to completion
    pub async fn handle_update(&self, update: &Update) -> Result<(), InterpreterError> {
        let Some(chat_id) = update.chat_id() else {
            tracing::debug!(update_id = update.update_id, "Ignoring update without a chat");
            return Ok(());
        };

        match update.chat_kind() {
            ChatKind::Private => self.handle_private(update, chat_id).await,
            ChatKind::Group | ChatKind::Supergroup => self.handle_group(update, chat_id).await,
            ChatKind::Channel => self.handle_channel(update, chat_id).await,
            ChatKind::Unknown => {
                tracing::debug!(chat_id, "Ignoring update from unknown chat type");
                Ok(())
            }
        }
    }

    async fn handle_private(&self, update: &Update, chat_id: ChatId) -> Result<(), InterpreterError> {
        if update.member_status() == Some("kicked") {
            tracing::info!(chat_id, user = %update.sender_name(), "Bot blocked by user");
            return Ok(());
        }
        if update.message.is_none() && update.callback_query.is_none() {
            return Ok(());
        }
        if update.message_text() == Some("/start") {
            tracing::info!(chat_id, user = %update.sender_name(), "Private chat started");
        }

        let session = self.sessions.get_or_create(&self.session_key(chat_id));
        let mut session = session.lock().await;
        self.process_private(update, &mut session).await
    }

    /// The interpreter algorithm for one private-chat update
    async fn process_private(
        &self,
        update: &Update,
        session: &mut ChatSession,
    ) -> Result<(), InterpreterError> {
        self.answer_callback(update);

        let payload = update
            .callback_data()
            .map(|data| template::render(data, &session.store, ""));
        self.retract_keyboards(update, session, payload.as_deref())
            .await;

        if self.route_request_thread(update, session).await {
            return Ok(());
        }

        let response = user_response(update.message_text(), payload.as_deref());

        let next = if let Some(trigger) = match_command(&response) {
            let Some(command) = self.definition.command(trigger) else {
                tracing::info!(chat_id = session.chat_id(), command = trigger, "Unknown command");
                let sent = self
                    .send_prompt(&self.definition.command_fallback, "", session)
                    .await?;
                session.last_message_sent = Some(sent);
                return Ok(());
            };
            match self.execute_action(&command.action, update, session).await? {
                Some(next) => next,
                None => return Ok(()),
            }
        } else if let Some(state) = session
            .current_state
            .as_deref()
            .and_then(|name| self.definition.state(name))
        {
            if state.reset_slots {
                session.store.clear_slots();
            }

            if !state.accepts(&response) {
                tracing::info!(
                    chat_id = session.chat_id(),
                    state = %state.name,
                    "Response failed validation"
                );
                self.send_fallback(state, session).await?;
                return Ok(());
            }

            for (source, slot) in &state.slots {
                let value = match source {
                    SlotSource::MessageText => response.clone(),
                    SlotSource::MessageId => update
                        .message_id()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                };
                if state.persist_slot {
                    session.store.capture(slot.clone(), value);
                } else {
                    session.store.set(slot.clone(), value);
                }
            }

            let Some(to) = resolve_transition(state, &response) else {
                tracing::info!(
                    chat_id = session.chat_id(),
                    state = %state.name,
                    "No transition matched"
                );
                self.send_fallback(state, session).await?;
                return Ok(());
            };
            to.to_string()
        } else {
            self.definition.start_state.clone()
        };

        self.run_states(next, update, session).await
    }

    /// Replies and button presses on request threads bypass the workflow.
    ///
    /// Returns true when the update was consumed; the session keeps its
    /// current state either way.
    async fn route_request_thread(&self, update: &Update, session: &mut ChatSession) -> bool {
        let (op, thread_text) = if let Some(text) = update.reply_to_text() {
            (ExtensionOp::AppendUserForm, text)
        } else if let Some(text) = update.callback_message_text() {
            (ExtensionOp::CancelRequest, text)
        } else {
            return false;
        };

        let Some(request_id) = last_line(thread_text) else {
            return false;
        };
        if !self.global.lock().unwrap().contains(request_id) {
            return false;
        }

        if !self.registry.contains(op) {
            tracing::debug!(op = %op, request_id, "Request thread operation not registered");
            return true;
        }
        if let Err(e) = self.call_extension(op, update, session).await {
            tracing::warn!(
                chat_id = session.chat_id(),
                op = %op,
                request_id,
                error = %e,
                "Request thread operation failed"
            );
        }
        true
    }

    async fn handle_group(&self, update: &Update, chat_id: ChatId) -> Result<(), InterpreterError> {
        self.answer_callback(update);

        let group = &self.definition.group;
        if !group.allows(chat_id, self.services.admin_chat_id) {
            tracing::debug!(chat_id, "Ignoring group outside the allowed chat");
            return Ok(());
        }

        let bot_username = self.bot.trim_start_matches('@');
        if update
            .new_members()
            .iter()
            .any(|m| m.username.as_deref() == Some(bot_username))
        {
            tracing::info!(chat_id, by = %update.sender_name(), "Joined group");
            return Ok(());
        }
        if matches!(update.member_status(), Some("left" | "kicked")) {
            tracing::info!(chat_id, by = %update.sender_name(), "Removed from group");
            return Ok(());
        }

        let session = self.sessions.get_or_create(&self.session_key(chat_id));
        let mut session = session.lock().await;

        if update.is_reply_to_bot() {
            if let Some(hook) = &group.reply_to_bot {
                self.execute_action(&hook.action, update, &mut session).await?;
            }
        }
        if update.is_callback_query() {
            if let Some(hook) = &group.callback_query {
                self.execute_action(&hook.action, update, &mut session).await?;
            }
        }
        Ok(())
    }

    async fn handle_channel(&self, update: &Update, chat_id: ChatId) -> Result<(), InterpreterError> {
        match update.member_status() {
            Some("administrator") => {
                tracing::info!(chat_id, by = %update.sender_name(), "Added to channel, leaving");
                self.services
                    .transport
                    .send_message(&OutgoingMessage::new(chat_id, CHANNEL_NOTICE))
                    .await?;
                self.services.transport.leave_chat(chat_id).await?;
            }
            Some("left" | "kicked") => {
                tracing::info!(chat_id, "Removed from channel");
            }
            _ if update.channel_post.is_some() => {
                tracing::warn!(chat_id, "Bot used in channel");
            }
            _ => {}
        }
        Ok(())
    }

    /// Acknowledge a button press without waiting for the platform
    fn answer_callback(&self, update: &Update) {
        let Some(callback_id) = update.callback_id() else {
            return;
        };
        let callback_id = callback_id.to_string();
        let transport = Arc::clone(&self.services.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.answer_callback(&callback_id).await {
                tracing::warn!(callback_id = %callback_id, error = %e, "Failed to answer callback");
            }
        });
    }

    /// Remove inline keyboards the user can no longer meaningfully press
    async fn retract_keyboards(
        &self,
        update: &Update,
        session: &mut ChatSession,
        payload: Option<&str>,
    ) {
        let chat_id = session.chat_id();
        let transport = &self.services.transport;

        let (edited, result) = if let Some(message) = update.callback_message() {
            let text = format!(
                "{} {}",
                message.text.as_deref().unwrap_or_default(),
                payload.unwrap_or_default()
            );
            let result = transport
                .edit_message_text(
                    chat_id,
                    message.message_id,
                    &text,
                    message.entities.as_ref(),
                    &Vec::new(),
                )
                .await;
            (message.message_id, result)
        } else if let Some(last) = session.last_message_sent.as_ref().filter(|m| m.has_keyboard()) {
            let result = transport
                .edit_message_text(
                    chat_id,
                    last.message_id,
                    &last.text,
                    last.entities.as_ref(),
                    &Vec::new(),
                )
                .await;
            (last.message_id, result)
        } else {
            return;
        };

        match result {
            Ok(()) => {
                // A callback may come from an older message than the last prompt
                if let Some(last) = session
                    .last_message_sent
                    .as_mut()
                    .filter(|m| m.message_id == edited)
                {
                    last.keyboard.clear();
                }
            }
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "Failed to retract keyboard");
            }
        }
    }
}
