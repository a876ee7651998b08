//! Process-wide store shared by every chat session

use super::SlotStore;
use crate::telegram::{ChatId, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Shared handle to the global store.
///
/// The lock is only ever held between suspension points, never across an
/// `.await`; cross-chat operations on one Request are best-effort.
pub type SharedGlobalStore = Arc<Mutex<GlobalStore>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Open,
    Closed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Open => "open",
            RequestStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted workflow outcome tracked independently of any one chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    /// Snapshot of the submitting chat's live slots
    pub data: BTreeMap<String, String>,
    pub status: RequestStatus,
    /// Chats entitled to close/append notifications
    pub active_chats: Vec<ChatId>,
    /// Latest admin-thread post for this request
    pub admin_thread_message_id: Option<MessageId>,
    pub admin_thread_message_text: String,
}

impl Request {
    fn new(id: String, data: BTreeMap<String, String>) -> Self {
        Self {
            id,
            data,
            status: RequestStatus::Open,
            active_chats: Vec::new(),
            admin_thread_message_id: None,
            admin_thread_message_text: String::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == RequestStatus::Open
    }

    pub fn is_active_for(&self, chat_id: ChatId) -> bool {
        self.active_chats.contains(&chat_id)
    }

    pub fn add_active_chat(&mut self, chat_id: ChatId) {
        if !self.is_active_for(chat_id) {
            self.active_chats.push(chat_id);
        }
    }

    /// Detach a chat; the request closes once nobody is left.
    ///
    /// Returns true when this removal closed the request.
    pub fn remove_active_chat(&mut self, chat_id: ChatId) -> bool {
        self.active_chats.retain(|c| *c != chat_id);
        if self.active_chats.is_empty() {
            self.status = RequestStatus::Closed;
            return true;
        }
        false
    }

    /// Close the request and return the chats that were still attached
    pub fn close(&mut self) -> Vec<ChatId> {
        self.status = RequestStatus::Closed;
        std::mem::take(&mut self.active_chats)
    }
}

/// Outcome of a form submission against the global store
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub request_id: String,
    /// True when a new Request was created, false when merged into one
    pub created: bool,
}

#[derive(Debug, Default)]
pub struct GlobalStore {
    requests: HashMap<String, Request>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedGlobalStore {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn request(&self, id: &str) -> Option<&Request> {
        self.requests.get(id)
    }

    pub fn request_mut(&mut self, id: &str) -> Option<&mut Request> {
        self.requests.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.requests.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Find the request whose data carries `key` in the dedup slot
    pub fn find_by_key(&self, dedup_slot: &str, key: &str) -> Option<&Request> {
        if key.is_empty() {
            return None;
        }
        self.requests
            .values()
            .find(|r| r.data.get(dedup_slot).map(String::as_str) == Some(key))
    }

    /// Record a form submission from `chat_id`.
    ///
    /// A submission whose dedup key matches an existing request reopens and
    /// merges into it instead of creating a second one. A forwarded text
    /// only replaces the forward slot; a full form replaces the data but
    /// keeps any earlier forwarded text.
    pub fn submit(
        &mut self,
        dedup_slot: &str,
        forward_slot: &str,
        store: &SlotStore,
        chat_id: ChatId,
    ) -> Submission {
        let key = store.get(dedup_slot).unwrap_or_default();
        let existing = self.find_by_key(dedup_slot, key).map(|r| r.id.clone());

        let (request_id, created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                self.requests
                    .insert(id.clone(), Request::new(id.clone(), store.slots().clone()));
                (id, true)
            }
        };

        if let Some(request) = self.requests.get_mut(&request_id) {
            if !created {
                request.status = RequestStatus::Open;
                match store.get(forward_slot).filter(|f| !f.is_empty()) {
                    Some(forwarded) => {
                        request
                            .data
                            .insert(forward_slot.to_string(), forwarded.to_string());
                    }
                    None => {
                        let previous = request.data.remove(forward_slot);
                        request.data = store.slots().clone();
                        if let Some(previous) = previous {
                            request.data.insert(forward_slot.to_string(), previous);
                        }
                    }
                }
            }
            request.add_active_chat(chat_id);
        }

        Submission {
            request_id,
            created,
        }
    }
}
