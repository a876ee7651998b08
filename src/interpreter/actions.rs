//! Action dispatcher and the bounded state loop

use super::{Interpreter, InterpreterError, MAX_STATE_STEPS};
use crate::extensions::{ExtensionContext, ExtensionError, ExtensionOp};
use crate::session::ChatSession;
use crate::telegram::{ChatTarget, MessageId, Update};
use crate::template;
use crate::transport::{OutgoingMessage, SentMessage, TransportError};
use crate::workflow::{Action, Prompt, SlotCaptures, SlotSource, State};

impl Interpreter {
    /// Enter `next` and keep following the states its actions yield.
    ///
    /// Stops when an action chain completes without naming a next state.
    pub(super) async fn run_states(
        &self,
        mut next: String,
        update: &Update,
        session: &mut ChatSession,
    ) -> Result<(), InterpreterError> {
        let entry = next.clone();

        for _ in 0..MAX_STATE_STEPS {
            let Some(state) = self.definition.state(&next) else {
                tracing::error!(chat_id = session.chat_id(), state = %next, "Unknown next state");
                return Err(InterpreterError::UnknownState(next));
            };
            session.current_state = Some(next);

            match self.run_actions(state, update, session).await? {
                Some(following) => next = following,
                None => return Ok(()),
            }
        }

        tracing::error!(
            chat_id = session.chat_id(),
            entry = %entry,
            state = session.current_state.as_deref().unwrap_or_default(),
            "State step limit exceeded"
        );
        Err(InterpreterError::StepLimitExceeded {
            entry,
            limit: MAX_STATE_STEPS,
        })
    }

    /// Run a state's chain in order, stopping at the first action naming a next state
    async fn run_actions(
        &self,
        state: &State,
        update: &Update,
        session: &mut ChatSession,
    ) -> Result<Option<String>, InterpreterError> {
        for action in &state.action {
            if let Some(next) = self.execute_action(action, update, session).await? {
                return Ok(Some(next));
            }
        }
        Ok(None)
    }

    /// Execute one action, returning the next state it names
    pub(super) async fn execute_action(
        &self,
        action: &Action,
        update: &Update,
        session: &mut ChatSession,
    ) -> Result<Option<String>, InterpreterError> {
        match action {
            Action::SendMessage {
                text,
                slots,
                default_slot_value,
            } => {
                let sent = self.send_prompt(text, default_slot_value, session).await?;
                capture_sent(session, slots, &sent);
                session.last_message_sent = Some(sent);
                Ok(None)
            }
            Action::ForwardMessage {
                to,
                message_id,
                slots,
            } => {
                let to: ChatTarget = parse_rendered(to, session, "forward destination")?;
                let message_id: MessageId = parse_rendered(message_id, session, "forward message id")?;
                let sent = self
                    .services
                    .transport
                    .forward_message(&to, session.chat_id(), message_id)
                    .await?;
                capture_sent(session, slots, &sent);
                session.last_message_sent = Some(sent);
                Ok(None)
            }
            Action::CallFunction {
                method,
                on_success,
                on_failure,
            } => {
                if !self.registry.contains(*method) {
                    tracing::warn!(method = %method, "Extension method not registered");
                    return Ok(None);
                }
                match self.call_extension(*method, update, session).await {
                    Ok(Some(next)) => Ok(Some(next)),
                    Ok(None) => Ok(on_success.clone()),
                    Err(e) => {
                        tracing::warn!(
                            chat_id = session.chat_id(),
                            method = %method,
                            error = %e,
                            "Extension function failed"
                        );
                        Ok(on_failure.clone())
                    }
                }
            }
            Action::GotoState { state } => Ok(Some(state.clone())),
            Action::Restart => {
                session.store.clear_slots();
                Ok(Some(self.definition.start_state.clone()))
            }
        }
    }

    /// Invoke a registered extension operation against a session
    pub(super) async fn call_extension(
        &self,
        op: ExtensionOp,
        update: &Update,
        session: &mut ChatSession,
    ) -> Result<Option<String>, ExtensionError> {
        let Some(function) = self.registry.get(op) else {
            return Ok(None);
        };
        let mut ctx = ExtensionContext {
            update,
            session,
            global: &self.global,
            definition: &self.definition,
            services: &self.services,
        };
        function.call(&mut ctx).await
    }

    /// Render a prompt and send it to the session's chat
    pub(super) async fn send_prompt(
        &self,
        prompt: &Prompt,
        default_slot_value: &str,
        session: &ChatSession,
    ) -> Result<SentMessage, TransportError> {
        let (text, keyboard) = prompt.render(&session.store, default_slot_value);
        self.services
            .transport
            .send_message(&OutgoingMessage::new(session.chat_id(), text).with_keyboard(keyboard))
            .await
    }

    /// Re-prompt with the state's fallback, or the definition default
    pub(super) async fn send_fallback(
        &self,
        state: &State,
        session: &mut ChatSession,
    ) -> Result<(), TransportError> {
        let prompt = state
            .fallback
            .as_ref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.definition.default_fallback);
        let sent = self.send_prompt(prompt, "", session).await?;
        session.last_message_sent = Some(sent);
        Ok(())
    }
}

/// Store what the platform echoed back into the action's slots
fn capture_sent(session: &mut ChatSession, slots: &SlotCaptures, sent: &SentMessage) {
    for (source, slot) in slots {
        let value = match source {
            SlotSource::MessageText => sent.text.clone(),
            SlotSource::MessageId => sent.message_id.to_string(),
        };
        session.store.capture(slot.clone(), value);
    }
}

fn parse_rendered<T: std::str::FromStr>(
    template_text: &str,
    session: &ChatSession,
    what: &str,
) -> Result<T, TransportError> {
    let rendered = template::render(template_text, &session.store, "");
    rendered
        .trim()
        .parse()
        .map_err(|_| TransportError::rejected(format!("invalid {what} `{rendered}`")))
}
