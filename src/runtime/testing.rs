//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use crate::db::{Record, RecordError, RecordResult};
use crate::extensions::ExtensionRegistry;
use crate::interpreter::{Interpreter, InterpreterError, Services};
use crate::session::{ChatSession, GlobalStore, SharedGlobalStore};
use crate::telegram::{
    CallbackQuery, Chat, ChatId, ChatKind, ChatMember, ChatMemberUpdated, ChatTarget, Message,
    MessageId, Update, User,
};
use crate::template::Keyboard;
use crate::transport::{OutgoingMessage, SentMessage, Transport, TransportError};
use crate::workflow::WorkflowDefinition;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const BOT: &str = "chatflow_test_bot";
pub const ADMIN_CHAT: ChatId = -1000;
pub const SHEET: &str = "requests";

// ============================================================================
// Mock Transport
// ============================================================================

/// One recorded outbound call
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Send(OutgoingMessage),
    Forward {
        to: ChatTarget,
        from: ChatId,
        message_id: MessageId,
    },
    Edit {
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
        keyboard: Keyboard,
    },
    Delete {
        chat_id: ChatId,
        message_id: MessageId,
    },
    AnswerCallback(String),
    LeaveChat(ChatId),
}

/// Records every call and echoes sent messages back with fresh ids
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    next_message_id: AtomicI64,
    fail_sends: AtomicBool,
    fail_edits: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(1000),
            fail_sends: AtomicBool::new(false),
            fail_edits: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_edits(&self, fail: bool) {
        self.fail_edits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Every message sent, in order
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Send(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn sent_to(&self, chat_id: ChatId) -> Vec<OutgoingMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect()
    }

    pub fn last_sent_to(&self, chat_id: ChatId) -> Option<OutgoingMessage> {
        self.sent_to(chat_id).pop()
    }

    pub fn edits(&self) -> Vec<TransportCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, TransportCall::Edit { .. }))
            .collect()
    }

    pub fn deletes(&self) -> Vec<(ChatId, MessageId)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Delete {
                    chat_id,
                    message_id,
                } => Some((chat_id, message_id)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_id(&self) -> MessageId {
        self.next_message_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, TransportError> {
        self.record(TransportCall::Send(message.clone()));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::network("mock send failure"));
        }
        Ok(SentMessage {
            message_id: self.next_id(),
            chat_id: message.chat_id,
            text: message.text.clone(),
            entities: None,
            keyboard: message.keyboard.clone(),
        })
    }

    async fn forward_message(
        &self,
        to: &ChatTarget,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<SentMessage, TransportError> {
        self.record(TransportCall::Forward {
            to: to.clone(),
            from,
            message_id,
        });
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::network("mock forward failure"));
        }
        Ok(SentMessage {
            message_id: self.next_id(),
            chat_id: match to {
                ChatTarget::Id(id) => *id,
                ChatTarget::Username(_) => 0,
            },
            text: format!("forwarded {message_id}"),
            entities: None,
            keyboard: Vec::new(),
        })
    }

    async fn edit_message_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        _entities: Option<&Value>,
        keyboard: &Keyboard,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Edit {
            chat_id,
            message_id,
            text: text.to_string(),
            keyboard: keyboard.clone(),
        });
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(TransportError::rejected("message is not modified"));
        }
        Ok(())
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Delete {
            chat_id,
            message_id,
        });
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(TransportError::rejected("not enough rights"));
        }
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        self.record(TransportCall::AnswerCallback(callback_id.to_string()));
        Ok(())
    }

    async fn leave_chat(&self, chat_id: ChatId) -> Result<(), TransportError> {
        self.record(TransportCall::LeaveChat(chat_id));
        Ok(())
    }
}

/// Transport whose sends block until released, one release per send
pub struct DelayedMockTransport {
    inner: Arc<MockTransport>,
    gate: Notify,
}

impl DelayedMockTransport {
    pub fn new(inner: Arc<MockTransport>) -> Self {
        Self {
            inner,
            gate: Notify::new(),
        }
    }

    /// Let one pending (or the next) send through
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Transport for DelayedMockTransport {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, TransportError> {
        self.gate.notified().await;
        self.inner.send_message(message).await
    }

    async fn forward_message(
        &self,
        to: &ChatTarget,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<SentMessage, TransportError> {
        self.inner.forward_message(to, from, message_id).await
    }

    async fn edit_message_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        entities: Option<&Value>,
        keyboard: &Keyboard,
    ) -> Result<(), TransportError> {
        self.inner
            .edit_message_text(chat_id, message_id, text, entities, keyboard)
            .await
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), TransportError> {
        self.inner.delete_message(chat_id, message_id).await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        self.inner.answer_callback(callback_id).await
    }

    async fn leave_chat(&self, chat_id: ChatId) -> Result<(), TransportError> {
        self.inner.leave_chat(chat_id).await
    }
}

// ============================================================================
// In-memory record store
// ============================================================================

#[derive(Default)]
pub struct InMemoryRecords {
    headers: Mutex<HashMap<String, Vec<String>>>,
    rows: Mutex<HashMap<String, Vec<Record>>>,
    fail: AtomicBool,
}

impl InMemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn headers(&self, sheet: &str) -> Option<Vec<String>> {
        self.headers.lock().unwrap().get(sheet).cloned()
    }

    pub fn rows(&self, sheet: &str) -> Vec<Record> {
        self.rows
            .lock()
            .unwrap()
            .get(sheet)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self) -> RecordResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RecordError::Io(std::io::Error::other("mock record failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecords {
    async fn init(&self, sheet: &str, headers: &[String]) -> RecordResult<()> {
        self.check()?;
        self.headers
            .lock()
            .unwrap()
            .insert(sheet.to_string(), headers.to_vec());
        Ok(())
    }

    async fn append_record(&self, sheet: &str, row: &Record) -> RecordResult<()> {
        self.check()?;
        self.rows
            .lock()
            .unwrap()
            .entry(sheet.to_string())
            .or_default()
            .push(row.clone());
        Ok(())
    }

    async fn update_record(&self, sheet: &str, key: &RecordKey, patch: &Record) -> RecordResult<()> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(sheet).and_then(|rows| {
            rows.iter_mut()
                .find(|row| row.get(&key.column).and_then(Value::as_str) == Some(key.value.as_str()))
        });
        if let Some(row) = row {
            for (k, v) in patch {
                row.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }
}

// ============================================================================
// Update builders
// ============================================================================

static NEXT_INBOUND_ID: AtomicI64 = AtomicI64::new(1);

fn user(id: i64) -> User {
    User {
        id,
        is_bot: false,
        username: Some(format!("user{}", id.unsigned_abs())),
        first_name: Some("Test".to_string()),
        last_name: None,
    }
}

fn bot_user() -> User {
    User {
        id: 1,
        is_bot: true,
        username: Some(BOT.to_string()),
        first_name: Some("Bot".to_string()),
        last_name: None,
    }
}

fn chat(id: ChatId, kind: ChatKind) -> Chat {
    Chat {
        id,
        kind,
        title: None,
    }
}

fn inbound(chat_id: ChatId, kind: ChatKind, text: &str) -> Message {
    Message {
        message_id: NEXT_INBOUND_ID.fetch_add(1, Ordering::SeqCst),
        chat: chat(chat_id, kind),
        from: Some(user(chat_id.abs())),
        date: 1_620_000_000,
        text: Some(text.to_string()),
        ..Message::default()
    }
}

fn bot_message(chat_id: ChatId, kind: ChatKind, text: &str) -> Message {
    Message {
        message_id: NEXT_INBOUND_ID.fetch_add(1, Ordering::SeqCst),
        chat: chat(chat_id, kind),
        from: Some(bot_user()),
        date: 1_620_000_000,
        text: Some(text.to_string()),
        ..Message::default()
    }
}

pub fn private_text(chat_id: ChatId, text: &str) -> Update {
    Update {
        message: Some(inbound(chat_id, ChatKind::Private, text)),
        ..Update::default()
    }
}

/// A button press on a bot message whose text is `message_text`
pub fn private_callback(chat_id: ChatId, data: &str, message_text: &str) -> Update {
    callback(chat_id, ChatKind::Private, data, message_text, user(chat_id))
}

pub fn private_reply(chat_id: ChatId, text: &str, reply_to_text: &str) -> Update {
    let mut message = inbound(chat_id, ChatKind::Private, text);
    message.reply_to_message = Some(Box::new(bot_message(chat_id, ChatKind::Private, reply_to_text)));
    Update {
        message: Some(message),
        ..Update::default()
    }
}

pub fn group_reply(chat_id: ChatId, text: &str, reply_to_text: &str) -> Update {
    let mut message = inbound(chat_id, ChatKind::Supergroup, text);
    message.from = Some(User {
        username: Some("admin".to_string()),
        ..user(7)
    });
    message.reply_to_message = Some(Box::new(bot_message(
        chat_id,
        ChatKind::Supergroup,
        reply_to_text,
    )));
    Update {
        message: Some(message),
        ..Update::default()
    }
}

pub fn group_callback(chat_id: ChatId, data: &str, message_text: &str) -> Update {
    let admin = User {
        username: Some("admin".to_string()),
        ..user(7)
    };
    callback(chat_id, ChatKind::Supergroup, data, message_text, admin)
}

fn callback(chat_id: ChatId, kind: ChatKind, data: &str, message_text: &str, from: User) -> Update {
    Update {
        callback_query: Some(CallbackQuery {
            id: format!("cb-{}", NEXT_INBOUND_ID.fetch_add(1, Ordering::SeqCst)),
            from,
            message: Some(bot_message(chat_id, kind, message_text)),
            data: Some(data.to_string()),
        }),
        ..Update::default()
    }
}

pub fn member_update(chat_id: ChatId, kind: ChatKind, status: &str) -> Update {
    Update {
        my_chat_member: Some(ChatMemberUpdated {
            chat: chat(chat_id, kind),
            from: user(9),
            new_chat_member: ChatMember {
                status: status.to_string(),
            },
        }),
        ..Update::default()
    }
}

// ============================================================================
// Test harness
// ============================================================================

/// Interpreter wired to mocks
pub struct TestHarness {
    pub interpreter: Arc<Interpreter>,
    pub transport: Arc<MockTransport>,
    pub records: Arc<InMemoryRecords>,
}

pub struct TestHarnessBuilder {
    workflow: String,
    registry: ExtensionRegistry,
}

impl TestHarness {
    pub fn builder(workflow: &str) -> TestHarnessBuilder {
        TestHarnessBuilder {
            workflow: workflow.to_string(),
            registry: ExtensionRegistry::request_lifecycle(),
        }
    }

    pub async fn send(&self, update: Update) -> Result<(), InterpreterError> {
        self.interpreter.handle_update(&update).await
    }

    /// Snapshot of a chat's session
    pub async fn session(&self, chat_id: ChatId) -> ChatSession {
        let key = self.interpreter.session_key(chat_id);
        let session = self
            .interpreter
            .sessions()
            .get(&key)
            .expect("session exists");
        let session = session.lock().await;
        session.clone()
    }

    pub async fn state(&self, chat_id: ChatId) -> Option<String> {
        self.session(chat_id).await.current_state
    }

    pub fn global(&self) -> &SharedGlobalStore {
        self.interpreter.global()
    }

    pub fn request_id(&self, reference: &str) -> Option<String> {
        self.global()
            .lock()
            .unwrap()
            .find_by_key("reference_id", reference)
            .map(|r| r.id.clone())
    }
}

impl TestHarnessBuilder {
    pub fn registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> TestHarness {
        let transport = Arc::new(MockTransport::new());
        self.build_with(Arc::clone(&transport) as Arc<dyn Transport>, transport)
    }

    /// Harness whose sends wait for `DelayedMockTransport::release`
    pub fn build_delayed(self) -> (TestHarness, Arc<DelayedMockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let delayed = Arc::new(DelayedMockTransport::new(Arc::clone(&transport)));
        let harness = self.build_with(Arc::clone(&delayed) as Arc<dyn Transport>, transport);
        (harness, delayed)
    }

    fn build_with(self, outbound: Arc<dyn Transport>, transport: Arc<MockTransport>) -> TestHarness {
        let definition =
            WorkflowDefinition::from_json(&self.workflow, &self.registry).expect("valid workflow");
        let records = Arc::new(InMemoryRecords::new());
        let services = Services {
            transport: outbound,
            records: Arc::clone(&records) as Arc<dyn RecordStore>,
            admin_chat_id: ADMIN_CHAT,
            record_sheet: SHEET.to_string(),
        };
        let interpreter = Interpreter::new(
            BOT,
            Arc::new(definition),
            self.registry,
            services,
            GlobalStore::shared(),
        );
        TestHarness {
            interpreter: Arc::new(interpreter),
            transport,
            records,
        }
    }
}

// ============================================================================
// Integration tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{ExtensionContext, ExtensionError, ExtensionFunction, ExtensionOp};
    use crate::session::RequestStatus;
    use crate::telegram::last_line;
    use crate::runtime::UpdateSerializer;
    use crate::template::Button;
    use std::time::Duration;

    const GREET: &str = r#"{
        "start_state": "greet",
        "default_fallback": "Sorry, I did not get that.",
        "command_fallback": "I do not know that command.",
        "commands": [
            {"trigger": "/start", "action": {"type": "restart"}},
            {"trigger": "/help", "action": {"type": "send_message", "text": "Help text"}}
        ],
        "states": [
            {
                "name": "greet",
                "action": {"type": "send_message", "text": "Hi! What is your name?"},
                "validation": "[A-Z][a-z]+",
                "fallback": "Please type your name, starting with a capital letter.",
                "slots": {"message_text": "name"},
                "transitions": [{"on": "*", "to": "menu"}]
            },
            {
                "name": "menu",
                "action": {"type": "send_message", "text": "Thanks {cache.name}. Continue? [[Yes, No][{cache.name}]]"},
                "transitions": [
                    {"on": "*", "to": "other"},
                    {"on": "Yes", "to": "confirmed"}
                ]
            },
            {
                "name": "confirmed",
                "action": {"type": "send_message", "text": "Confirmed, {name}!", "default_slot_value": "friend"},
                "transitions": [{"on": "*", "to": "fresh"}]
            },
            {
                "name": "other",
                "action": {"type": "send_message", "text": "Something else then."}
            },
            {
                "name": "fresh",
                "reset_slots": true,
                "action": {"type": "send_message", "text": "Start over? [[{cache.name}]]"},
                "slots": {"message_text": "nickname"},
                "persist_slot": false,
                "transitions": [{"on": "*", "to": "other"}]
            }
        ]
    }"#;

    const REQUESTS: &str = r#"{
        "start_state": "ask_name",
        "default_fallback": "Sorry?",
        "states": [
            {
                "name": "ask_name",
                "action": {"type": "send_message", "text": "Name?"},
                "slots": {"message_text": "name"},
                "transitions": [{"on": "*", "to": "ask_ref"}]
            },
            {
                "name": "ask_ref",
                "action": {"type": "send_message", "text": "Reference?"},
                "slots": {"message_text": "reference_id"},
                "transitions": [{"on": "*", "to": "check"}]
            },
            {
                "name": "check",
                "action": {"type": "call_function", "method": "checkDuplicate", "on_success": "submit"}
            },
            {
                "name": "duplicate",
                "action": {"type": "call_function", "method": "confirmDuplicateUpdate"},
                "transitions": [{"on": "Yes", "to": "merge"}, {"on": "No", "to": "ask_name"}]
            },
            {
                "name": "merge",
                "action": {"type": "call_function", "method": "updateDuplicate", "on_success": "submit"}
            },
            {
                "name": "submit",
                "action": {"type": "call_function", "method": "submitForm", "on_success": "done", "on_failure": "failed"}
            },
            {
                "name": "done",
                "action": {"type": "send_message", "text": "Submitted."},
                "transitions": [{"on": "*", "to": "ask_name"}]
            },
            {
                "name": "failed",
                "action": {"type": "send_message", "text": "Something went wrong."}
            },
            {
                "name": "paste",
                "action": {"type": "send_message", "text": "Paste the request text."},
                "slots": {"message_text": "forward_message"},
                "transitions": [{"on": "*", "to": "validate"}]
            },
            {
                "name": "validate",
                "action": {"type": "call_function", "method": "validateForwardTemplate", "on_success": "check", "on_failure": "paste_failed"}
            },
            {
                "name": "paste_failed",
                "action": {"type": "send_message", "text": "Could not read that."}
            }
        ],
        "commands": [
            {"trigger": "/paste", "action": {"type": "goto_state", "state": "paste"}}
        ],
        "group": {
            "reply_to_bot": {"action": {"type": "call_function", "method": "appendAdminForm"}},
            "callback_query": {"action": {"type": "call_function", "method": "closeRequest"}}
        },
        "requests": {
            "duplicate_state": "duplicate",
            "forward_state": "submit",
            "dedup_extract": "\\d{3}",
            "summary": "Name: {name}\nReference: {reference_id}",
            "record_headers": ["request_id", "name", "reference_id", "status"]
        }
    }"#;

    /// Extension that always fails
    struct Failing;

    #[async_trait]
    impl ExtensionFunction for Failing {
        async fn call(&self, _ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
            Err(ExtensionError::Rejected("nope".to_string()))
        }
    }

    /// Extension that names a fixed next state
    struct Goto(&'static str);

    #[async_trait]
    impl ExtensionFunction for Goto {
        async fn call(&self, _ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError> {
            Ok(Some(self.0.to_string()))
        }
    }

    fn texts(messages: &[OutgoingMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    fn labels(keyboard: &Keyboard) -> Vec<Vec<&str>> {
        keyboard
            .iter()
            .map(|row| row.iter().map(|b| b.label.as_str()).collect())
            .collect()
    }

    // ------------------------------------------------------------------
    // Interpreter algorithm
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_fresh_session_enters_start_state() {
        let h = TestHarness::builder(GREET).build();
        h.send(private_text(1, "hello")).await.unwrap();

        assert_eq!(h.state(1).await.as_deref(), Some("greet"));
        assert_eq!(texts(&h.transport.sent_to(1)), vec!["Hi! What is your name?"]);
    }

    #[tokio::test]
    async fn test_end_to_end_greeting() {
        let h = TestHarness::builder(GREET).build();
        h.send(private_text(1, "hi")).await.unwrap();

        // Fails validation: fallback, no capture, no transition
        h.send(private_text(1, "hello")).await.unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("greet"));
        assert_eq!(
            h.transport.last_sent_to(1).unwrap().text,
            "Please type your name, starting with a capital letter."
        );
        assert_eq!(h.session(1).await.store.get("name"), None);

        h.send(private_text(1, "Asha")).await.unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("menu"));
        let menu = h.transport.last_sent_to(1).unwrap();
        assert_eq!(menu.text, "Thanks Asha. Continue?");
        assert_eq!(labels(&menu.keyboard), vec![vec!["Yes", "No"], vec!["Asha"]]);
        assert_eq!(h.session(1).await.store.cached("name"), Some("Asha"));
    }

    #[tokio::test]
    async fn test_exact_transition_beats_wildcard() {
        let h = TestHarness::builder(GREET).build();
        h.send(private_text(1, "hi")).await.unwrap();
        h.send(private_text(1, "Asha")).await.unwrap();
        h.send(private_callback(1, "Yes", "Thanks Asha. Continue?"))
            .await
            .unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("confirmed"));
        assert_eq!(h.transport.last_sent_to(1).unwrap().text, "Confirmed, Asha!");

        let h = TestHarness::builder(GREET).build();
        h.send(private_text(2, "hi")).await.unwrap();
        h.send(private_text(2, "Ravi")).await.unwrap();
        h.send(private_text(2, "Maybe")).await.unwrap();
        assert_eq!(h.state(2).await.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_callback_payload_is_rendered_and_keyboard_retracted() {
        let h = TestHarness::builder(GREET).build();
        h.send(private_text(1, "hi")).await.unwrap();
        h.send(private_text(1, "Asha")).await.unwrap();

        // The name button carries a placeholder payload
        h.send(private_callback(1, "{cache.name}", "Thanks Asha. Continue?"))
            .await
            .unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("other"));

        let edits = h.transport.edits();
        let TransportCall::Edit { text, keyboard, .. } = edits.last().unwrap() else {
            unreachable!()
        };
        assert_eq!(text, "Thanks Asha. Continue? Asha");
        assert!(keyboard.is_empty());
    }

    #[tokio::test]
    async fn test_new_text_retracts_last_keyboard() {
        let h = TestHarness::builder(GREET).build();
        h.send(private_text(1, "hi")).await.unwrap();
        h.send(private_text(1, "Asha")).await.unwrap();
        let menu_id = h.session(1).await.last_message_sent.unwrap().message_id;
        assert!(h.transport.edits().is_empty());

        h.transport.fail_edits(true);
        // Retraction failures are swallowed
        h.send(private_text(1, "Yes")).await.unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("confirmed"));
        assert!(matches!(
            h.transport.edits().as_slice(),
            [TransportCall::Edit { message_id, .. }] if *message_id == menu_id
        ));
    }

    #[tokio::test]
    async fn test_reset_slots_keeps_cache() {
        let h = TestHarness::builder(GREET).build();
        for text in ["hi", "Asha", "Yes", "anything"] {
            h.send(private_text(1, text)).await.unwrap();
        }
        assert_eq!(h.state(1).await.as_deref(), Some("fresh"));
        let prompt = h.transport.last_sent_to(1).unwrap();
        assert_eq!(labels(&prompt.keyboard), vec![vec!["Asha"]]);

        h.send(private_text(1, "Ash")).await.unwrap();
        let session = h.session(1).await;
        assert_eq!(session.store.get("name"), None);
        assert_eq!(session.store.cached("name"), Some("Asha"));
        // persist_slot: false keeps the capture out of the cache
        assert_eq!(session.store.get("nickname"), Some("Ash"));
        assert_eq!(session.store.cached("nickname"), None);
        assert_eq!(session.current_state.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_unknown_command_sends_command_fallback() {
        let h = TestHarness::builder(GREET).build();
        h.send(private_text(1, "hi")).await.unwrap();
        h.send(private_text(1, "/nope")).await.unwrap();

        assert_eq!(h.transport.last_sent_to(1).unwrap().text, "I do not know that command.");
        assert_eq!(h.state(1).await.as_deref(), Some("greet"));
    }

    #[tokio::test]
    async fn test_command_bypasses_validation() {
        let h = TestHarness::builder(GREET).build();
        h.send(private_text(1, "hi")).await.unwrap();
        h.send(private_text(1, "/help")).await.unwrap();

        assert_eq!(h.transport.last_sent_to(1).unwrap().text, "Help text");
        assert_eq!(h.state(1).await.as_deref(), Some("greet"));
    }

    #[tokio::test]
    async fn test_restart_clears_slots_but_not_cache() {
        let h = TestHarness::builder(GREET).build();
        for text in ["hi", "Asha"] {
            h.send(private_text(1, text)).await.unwrap();
        }
        h.send(private_text(1, "/start")).await.unwrap();

        let session = h.session(1).await;
        assert_eq!(session.current_state.as_deref(), Some("greet"));
        assert_eq!(session.store.get("name"), None);
        assert_eq!(session.store.cached("name"), Some("Asha"));
        assert_eq!(h.transport.last_sent_to(1).unwrap().text, "Hi! What is your name?");
    }

    #[tokio::test]
    async fn test_runaway_loop_is_bounded() {
        let workflow = r#"{
            "start_state": "ping",
            "states": [
                {"name": "ping", "action": {"type": "goto_state", "state": "pong"}},
                {"name": "pong", "action": {"type": "goto_state", "state": "ping"}}
            ]
        }"#;
        let h = TestHarness::builder(workflow).build();
        let err = h.send(private_text(1, "hi")).await.unwrap_err();

        assert!(matches!(
            err,
            InterpreterError::StepLimitExceeded { ref entry, limit: 64 } if entry == "ping"
        ));
        let state = h.state(1).await.unwrap();
        assert!(state == "ping" || state == "pong");
    }

    #[tokio::test]
    async fn test_extension_failure_routes_to_on_failure() {
        let workflow = r#"{
            "start_state": "start",
            "states": [
                {"name": "start", "action": [
                    {"type": "call_function", "method": "checkDuplicate", "on_success": "ok", "on_failure": "sorry"},
                    {"type": "send_message", "text": "not reached"}
                ]},
                {"name": "ok", "action": {"type": "send_message", "text": "ok"}},
                {"name": "sorry", "action": {"type": "send_message", "text": "sorry"}}
            ]
        }"#;
        let registry = ExtensionRegistry::new().with(ExtensionOp::CheckDuplicate, Arc::new(Failing));
        let h = TestHarness::builder(workflow).registry(registry).build();
        h.send(private_text(1, "hi")).await.unwrap();

        assert_eq!(h.state(1).await.as_deref(), Some("sorry"));
        assert_eq!(texts(&h.transport.sent_to(1)), vec!["sorry"]);
    }

    #[tokio::test]
    async fn test_extension_failure_without_on_failure_stays() {
        let workflow = r#"{
            "start_state": "start",
            "states": [
                {"name": "start", "action": [
                    {"type": "call_function", "method": "checkDuplicate", "on_success": "ok"},
                    {"type": "send_message", "text": "still here"}
                ]},
                {"name": "ok", "action": {"type": "send_message", "text": "ok"}}
            ]
        }"#;
        let registry = ExtensionRegistry::new().with(ExtensionOp::CheckDuplicate, Arc::new(Failing));
        let h = TestHarness::builder(workflow).registry(registry).build();
        h.send(private_text(1, "hi")).await.unwrap();

        assert_eq!(h.state(1).await.as_deref(), Some("start"));
        assert_eq!(texts(&h.transport.sent_to(1)), vec!["still here"]);
    }

    #[tokio::test]
    async fn test_returned_state_overrides_on_success() {
        let workflow = r#"{
            "start_state": "start",
            "states": [
                {"name": "start", "action": {"type": "call_function", "method": "checkDuplicate", "on_success": "ok"}},
                {"name": "ok", "action": {"type": "send_message", "text": "ok"}},
                {"name": "elsewhere", "action": {"type": "send_message", "text": "elsewhere"}}
            ]
        }"#;
        let registry =
            ExtensionRegistry::new().with(ExtensionOp::CheckDuplicate, Arc::new(Goto("elsewhere")));
        let h = TestHarness::builder(workflow).registry(registry).build();
        h.send(private_text(1, "hi")).await.unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("elsewhere"));

        let registry =
            ExtensionRegistry::new().with(ExtensionOp::CheckDuplicate, Arc::new(Goto("missing")));
        let h = TestHarness::builder(workflow).registry(registry).build();
        let err = h.send(private_text(2, "hi")).await.unwrap_err();
        assert!(matches!(err, InterpreterError::UnknownState(ref s) if s == "missing"));
        assert_eq!(h.state(2).await.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let h = TestHarness::builder(GREET).build();
        h.transport.fail_sends(true);
        let err = h.send(private_text(1, "hi")).await.unwrap_err();
        assert!(matches!(err, InterpreterError::Transport(_)));
        assert_eq!(h.state(1).await.as_deref(), Some("greet"));
    }

    #[tokio::test]
    async fn test_forward_message_renders_targets() {
        let workflow = r#"{
            "start_state": "start",
            "states": [
                {"name": "start", "action": {"type": "send_message", "text": "Send something"},
                 "slots": {"message_id": "source"}, "transitions": [{"on": "*", "to": "fwd"}]},
                {"name": "fwd", "action": {"type": "forward_message", "to": "-1000", "message_id": "{source}",
                 "slots": {"message_id": "forwarded_id"}}}
            ]
        }"#;
        let h = TestHarness::builder(workflow).build();
        h.send(private_text(1, "hi")).await.unwrap();
        let update = private_text(1, "please forward");
        let source = update.message_id().unwrap();
        h.send(update).await.unwrap();

        assert!(h.transport.calls().contains(&TransportCall::Forward {
            to: ChatTarget::Id(ADMIN_CHAT),
            from: 1,
            message_id: source,
        }));
        let session = h.session(1).await;
        assert!(session.store.cached("forwarded_id").is_some());
        assert_eq!(session.store.get("source"), Some(source.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_forward_to_public_username() {
        let workflow = r#"{
            "start_state": "start",
            "states": [
                {"name": "start", "action": {"type": "send_message", "text": "Send something"},
                 "slots": {"message_id": "source", "message_text": "channel"},
                 "transitions": [{"on": "*", "to": "fwd"}]},
                {"name": "fwd", "action": {"type": "forward_message", "to": "{channel}", "message_id": "{source}"}}
            ]
        }"#;
        let h = TestHarness::builder(workflow).build();
        h.send(private_text(1, "hi")).await.unwrap();
        let update = private_text(1, "@relief_updates");
        let source = update.message_id().unwrap();
        h.send(update).await.unwrap();

        assert!(h.transport.calls().contains(&TransportCall::Forward {
            to: ChatTarget::Username("@relief_updates".to_string()),
            from: 1,
            message_id: source,
        }));
    }

    #[tokio::test]
    async fn test_same_chat_updates_do_not_interleave() {
        let (h, delayed) = TestHarness::builder(GREET).build_delayed();
        let serializer = UpdateSerializer::new();
        let key = h.interpreter.session_key(1);

        let first = {
            let interpreter = Arc::clone(&h.interpreter);
            serializer.enqueue(key.clone(), async move {
                interpreter.handle_update(&private_text(1, "hi")).await
            })
        };
        // State seen by the second job when the lane starts it
        let observed = Arc::new(Mutex::new(None));
        let second = {
            let interpreter = Arc::clone(&h.interpreter);
            let observed = Arc::clone(&observed);
            serializer.enqueue(key.clone(), async move {
                let session = interpreter.sessions().get_or_create(&key);
                let state = session.lock().await.current_state.clone();
                *observed.lock().unwrap() = Some(state);
                interpreter.handle_update(&private_text(1, "Asha")).await
            })
        };

        // The first update is parked inside its send
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.transport.sent().is_empty());
        assert!(observed.lock().unwrap().is_none());

        delayed.release();
        first.wait().await.unwrap();

        // The second update started after the first finished and is parked in its send
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*observed.lock().unwrap(), Some(Some("greet".to_string())));
        assert_eq!(texts(&h.transport.sent()), vec!["Hi! What is your name?"]);

        delayed.release();
        second.wait().await.unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("menu"));
        assert_eq!(
            texts(&h.transport.sent_to(1)),
            vec!["Hi! What is your name?", "Thanks Asha. Continue?"]
        );
    }

    // ------------------------------------------------------------------
    // Chat-type routing
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_channel_join_posts_notice_and_leaves() {
        let h = TestHarness::builder(GREET).build();
        h.send(member_update(-55, ChatKind::Channel, "administrator"))
            .await
            .unwrap();

        let calls = h.transport.calls();
        assert!(matches!(&calls[0], TransportCall::Send(m) if m.chat_id == -55));
        assert_eq!(calls[1], TransportCall::LeaveChat(-55));
    }

    #[tokio::test]
    async fn test_blocked_private_chat_is_only_logged() {
        let h = TestHarness::builder(GREET).build();
        h.send(member_update(1, ChatKind::Private, "kicked")).await.unwrap();
        assert!(h.transport.calls().is_empty());
        assert!(h.interpreter.sessions().get(&h.interpreter.session_key(1)).is_none());
    }

    #[tokio::test]
    async fn test_group_without_hooks_is_ignored() {
        let h = TestHarness::builder(GREET).build();
        h.send(group_reply(ADMIN_CHAT, "hello bot", "anything"))
            .await
            .unwrap();
        assert!(h.transport.sent().is_empty());
    }

    // ------------------------------------------------------------------
    // Request lifecycle
    // ------------------------------------------------------------------

    async fn submit(h: &TestHarness, chat_id: ChatId, name: &str, reference: &str) {
        for text in ["hi", name, reference] {
            h.send(private_text(chat_id, text)).await.unwrap();
        }
    }

    fn admin_thread(h: &TestHarness, request_id: &str) -> (String, Option<MessageId>) {
        let global = h.global().lock().unwrap();
        let request = global.request(request_id).unwrap();
        (
            request.admin_thread_message_text.clone(),
            request.admin_thread_message_id,
        )
    }

    #[tokio::test]
    async fn test_initialize_prepares_sheet() {
        let h = TestHarness::builder(REQUESTS).build();
        h.interpreter.initialize().await.unwrap();
        assert_eq!(
            h.records.headers(SHEET).unwrap(),
            vec!["request_id", "name", "reference_id", "status"]
        );
    }

    #[tokio::test]
    async fn test_submit_creates_request_and_threads() {
        let h = TestHarness::builder(REQUESTS).build();
        submit(&h, 1, "Asha", "777").await;

        assert_eq!(h.state(1).await.as_deref(), Some("done"));
        let id = h.request_id("777").unwrap();

        let (admin_text, admin_id) = admin_thread(&h, &id);
        assert!(admin_text.starts_with("STATUS: OPEN"));
        assert!(admin_text.contains("Name: Asha\nReference: 777"));
        assert_eq!(last_line(&admin_text), Some(id.as_str()));
        let admin_post = h.transport.last_sent_to(ADMIN_CHAT).unwrap();
        assert_eq!(admin_post.keyboard, vec![vec![Button::new("Close Request", "Close Request")]]);
        assert!(admin_id.is_some());

        let user_posts = h.transport.sent_to(1);
        let thread = &user_posts[user_posts.len() - 2];
        assert!(thread.text.starts_with("Reference: 777"));
        assert_eq!(last_line(&thread.text), Some(id.as_str()));
        assert_eq!(labels(&thread.keyboard), vec![vec!["Cancel Request"]]);
        assert_eq!(user_posts.last().unwrap().text, "Submitted.");

        let rows = h.records.rows(SHEET);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["request_id"], id.as_str());
        assert_eq!(rows[0]["name"], "Asha");
        assert_eq!(rows[0]["status"], "open");
    }

    #[tokio::test]
    async fn test_record_failures_do_not_block_chat() {
        let h = TestHarness::builder(REQUESTS).build();
        h.records.fail(true);
        submit(&h, 1, "Asha", "777").await;
        assert_eq!(h.state(1).await.as_deref(), Some("done"));
        assert!(h.request_id("777").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_reference_is_merged() {
        let h = TestHarness::builder(REQUESTS).build();
        submit(&h, 1, "Asha", "777").await;
        submit(&h, 2, "Ravi", "777").await;

        assert_eq!(h.state(2).await.as_deref(), Some("duplicate"));
        let confirm = h.transport.last_sent_to(2).unwrap();
        assert!(confirm.text.contains("Name: Asha"));
        assert!(confirm.text.ends_with("Do you want to update this request?"));
        assert_eq!(labels(&confirm.keyboard), vec![vec!["Yes", "No"]]);

        h.send(private_callback(2, "Yes", &confirm.text)).await.unwrap();
        assert_eq!(h.state(2).await.as_deref(), Some("done"));
        assert_eq!(h.global().lock().unwrap().len(), 1);

        let id = h.request_id("777").unwrap();
        let global = h.global().lock().unwrap();
        let request = global.request(&id).unwrap();
        assert_eq!(request.active_chats, vec![1, 2]);
        assert_eq!(request.data.get("name").map(String::as_str), Some("Asha"));
        drop(global);
        assert_eq!(h.records.rows(SHEET).len(), 1);
    }

    #[tokio::test]
    async fn test_admin_repost_deletes_previous_post() {
        let h = TestHarness::builder(REQUESTS).build();
        submit(&h, 1, "Asha", "777").await;
        let id = h.request_id("777").unwrap();
        let (_, first_post) = admin_thread(&h, &id);

        h.send(private_reply(1, "Also needs oxygen", &h.transport.sent_to(1)[2].text))
            .await
            .unwrap();

        let (text, second_post) = admin_thread(&h, &id);
        assert_ne!(first_post, second_post);
        assert!(h.transport.deletes().contains(&(ADMIN_CHAT, first_post.unwrap())));
        assert!(text.contains("Also needs oxygen"));
        assert_eq!(text.matches("STATUS").count(), 1);
        // Thread replies leave the workflow position alone
        assert_eq!(h.state(1).await.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_user_cancel_closes_when_last_chat_leaves() {
        let h = TestHarness::builder(REQUESTS).build();
        submit(&h, 1, "Asha", "777").await;
        let id = h.request_id("777").unwrap();
        let thread = h.transport.sent_to(1)[2].text.clone();

        h.send(private_callback(1, "Cancel Request", &thread)).await.unwrap();

        {
            let global = h.global().lock().unwrap();
            let request = global.request(&id).unwrap();
            assert_eq!(request.status, RequestStatus::Closed);
            assert!(request.active_chats.is_empty());
        }
        let (admin_text, _) = admin_thread(&h, &id);
        assert!(admin_text.starts_with("STATUS: CLOSED"));
        assert!(admin_text.contains("< User cancelled the request >"));
        assert!(h.transport.last_sent_to(ADMIN_CHAT).unwrap().keyboard.is_empty());
        assert!(h
            .transport
            .last_sent_to(1)
            .unwrap()
            .text
            .contains("successfully cancelled"));
        assert_eq!(h.state(1).await.as_deref(), Some("done"));

        // A second press on the same thread is answered as closed
        h.send(private_callback(1, "Cancel Request", &thread)).await.unwrap();
        assert!(h.transport.last_sent_to(1).unwrap().text.contains("This request is closed"));
    }

    #[tokio::test]
    async fn test_thread_cancel_keeps_prompt_keyboard_for_retraction() {
        let workflow = REQUESTS.replace(r#""text": "Submitted.""#, r#""text": "Submitted. [[Again]]""#);
        let h = TestHarness::builder(&workflow).build();
        submit(&h, 1, "Asha", "777").await;
        let prompt = h.session(1).await.last_message_sent.unwrap();
        assert!(prompt.has_keyboard());
        let thread = h.transport.sent_to(1)[2].text.clone();

        h.send(private_callback(1, "Cancel Request", &thread)).await.unwrap();
        // Only the thread message was edited
        assert!(h.session(1).await.last_message_sent.unwrap().has_keyboard());

        h.send(private_text(1, "hello")).await.unwrap();
        assert!(h.transport.edits().iter().any(|call| matches!(
            call,
            TransportCall::Edit { message_id, keyboard, .. }
                if *message_id == prompt.message_id && keyboard.is_empty()
        )));
    }

    #[tokio::test]
    async fn test_admin_reply_fans_out_and_close_notifies() {
        let h = TestHarness::builder(REQUESTS).build();
        submit(&h, 1, "Asha", "777").await;
        let id = h.request_id("777").unwrap();
        let (admin_text, _) = admin_thread(&h, &id);

        let reply = group_reply(ADMIN_CHAT, "Bed found at City Hospital", &admin_text);
        let reply_id = reply.message_id().unwrap();
        h.send(reply).await.unwrap();

        let fanned = h.transport.last_sent_to(1).unwrap();
        assert!(fanned.text.contains("Bed found at City Hospital"));
        assert_eq!(last_line(&fanned.text), Some(id.as_str()));
        assert!(h.transport.deletes().contains(&(ADMIN_CHAT, reply_id)));
        let (admin_text, _) = admin_thread(&h, &id);
        assert!(admin_text.contains("Replied by @admin"));

        h.send(group_callback(ADMIN_CHAT, "Close Request", &admin_text))
            .await
            .unwrap();
        let (admin_text, _) = admin_thread(&h, &id);
        assert!(admin_text.starts_with("STATUS: CLOSED"));
        assert!(admin_text.contains("< @admin closed the request >"));
        let notice = h.transport.last_sent_to(1).unwrap();
        assert!(notice.text.contains("Your request has been closed."));
        assert!(!notice.text.contains("Reply to this message"));

        // A user reply after closing is bounced
        h.send(private_reply(1, "hello?", &notice.text)).await.unwrap();
        assert!(h.transport.last_sent_to(1).unwrap().text.contains("This request is closed"));

        // Closing twice only notes it on the thread
        let sent_before = h.transport.sent_to(1).len();
        h.send(group_callback(ADMIN_CHAT, "Close Request", &admin_text))
            .await
            .unwrap();
        let (admin_text, _) = admin_thread(&h, &id);
        assert!(admin_text.contains("This request has already been closed."));
        assert_eq!(h.transport.sent_to(1).len(), sent_before);
    }

    #[tokio::test]
    async fn test_admin_reply_to_closed_request_is_ignored() {
        let h = TestHarness::builder(REQUESTS).build();
        submit(&h, 1, "Asha", "777").await;
        let id = h.request_id("777").unwrap();
        let thread = h.transport.sent_to(1)[2].text.clone();
        h.send(private_callback(1, "Cancel Request", &thread)).await.unwrap();
        let sent_before = h.transport.sent_to(1).len();

        let (admin_text, _) = admin_thread(&h, &id);
        h.transport.fail_deletes(true);
        h.send(group_reply(ADMIN_CHAT, "Too late", &admin_text))
            .await
            .unwrap();

        let (admin_text, _) = admin_thread(&h, &id);
        assert!(admin_text.contains("has been ignored"));
        assert!(admin_text.contains("Too late"));
        assert_eq!(h.transport.sent_to(1).len(), sent_before);
    }

    #[tokio::test]
    async fn test_other_group_callbacks_are_ignored() {
        let h = TestHarness::builder(REQUESTS).build();
        submit(&h, 1, "Asha", "777").await;
        let id = h.request_id("777").unwrap();
        let (admin_text, _) = admin_thread(&h, &id);

        h.send(group_callback(ADMIN_CHAT, "Something else", &admin_text))
            .await
            .unwrap();
        assert!(h.global().lock().unwrap().request(&id).unwrap().is_open());

        // The callback is still acknowledged, off the update path
        let answered = tokio::time::timeout(Duration::from_secs(1), async {
            while !h
                .transport
                .calls()
                .iter()
                .any(|c| matches!(c, TransportCall::AnswerCallback(_)))
            {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(answered.is_ok());
    }

    #[tokio::test]
    async fn test_forward_template_validation() {
        let h = TestHarness::builder(REQUESTS).build();
        h.send(private_text(1, "hi")).await.unwrap();
        h.send(private_text(1, "/paste")).await.unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("paste"));

        h.send(private_text(1, "no reference in here")).await.unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("paste_failed"));
        let sent = h.transport.sent_to(1);
        let invalid = &sent[sent.len() - 2];
        assert!(invalid.text.starts_with("The template is invalid."));
        assert_eq!(labels(&invalid.keyboard), vec![vec!["Cancel"]]);

        h.send(private_text(1, "/paste")).await.unwrap();
        h.send(private_text(1, "Patient: Asha\nRef 777\nNeeds ICU")).await.unwrap();
        assert_eq!(h.state(1).await.as_deref(), Some("done"));

        let id = h.request_id("777").unwrap();
        let (admin_text, _) = admin_thread(&h, &id);
        assert!(admin_text.contains("Needs ICU"));
        assert_eq!(h.session(1).await.store.cached("reference_id"), Some("777"));
    }
}
