//! Workflow definition types

use super::{GroupSettings, Prompt, RequestSettings};
use crate::extensions::ExtensionOp;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Transition value that matches any response
pub const WILDCARD: &str = "*";

/// Where a captured slot value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    MessageText,
    MessageId,
}

/// Slot captures: data kind to slot name
pub type SlotCaptures = BTreeMap<SlotSource, String>;

/// One step of a state's action chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    SendMessage {
        text: Prompt,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        slots: SlotCaptures,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        default_slot_value: String,
    },
    ForwardMessage {
        to: String,
        message_id: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        slots: SlotCaptures,
    },
    CallFunction {
        method: ExtensionOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_success: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_failure: Option<String>,
    },
    GotoState {
        state: String,
    },
    Restart,
}

impl Action {
    /// State names this action can jump to
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Action::CallFunction {
                on_success,
                on_failure,
                ..
            } => on_success
                .iter()
                .chain(on_failure.iter())
                .map(String::as_str)
                .collect(),
            Action::GotoState { state } => vec![state.as_str()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub on: String,
    pub to: String,
}

/// A global trigger such as `/start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub trigger: String,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub action: Vec<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Prompt>,
    #[serde(default)]
    pub reset_slots: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub slots: SlotCaptures,
    /// When false, captures only go to the live store
    #[serde(default = "default_persist")]
    pub persist_slot: bool,
    #[serde(skip)]
    validator: Option<Regex>,
}

fn default_persist() -> bool {
    true
}

/// Accept a single action or a list; keeps inner error messages intact
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Action>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(D::Error::custom))
            .collect(),
        single => serde_json::from_value(single)
            .map(|action| vec![action])
            .map_err(D::Error::custom),
    }
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Vec::new(),
            transitions: Vec::new(),
            validation: None,
            fallback: None,
            reset_slots: false,
            slots: SlotCaptures::new(),
            persist_slot: true,
            validator: None,
        }
    }

    pub(super) fn compile(&mut self) -> Result<(), regex::Error> {
        self.validator = self
            .validation
            .as_deref()
            .map(|pattern| Regex::new(&format!("^(?:{pattern})$")))
            .transpose()?;
        Ok(())
    }

    /// Whether a response passes this state's validation pattern
    pub fn accepts(&self, response: &str) -> bool {
        self.validator.as_ref().map_or(true, |re| re.is_match(response))
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.action == other.action
            && self.transitions == other.transitions
            && self.validation == other.validation
            && self.fallback == other.fallback
            && self.reset_slots == other.reset_slots
            && self.slots == other.slots
            && self.persist_slot == other.persist_slot
    }
}

/// A loaded and validated workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub start_state: String,
    #[serde(default)]
    pub default_fallback: Prompt,
    #[serde(default)]
    pub command_fallback: Prompt,
    #[serde(default)]
    pub commands: Vec<Command>,
    pub states: Vec<State>,
    #[serde(default)]
    pub group: GroupSettings,
    #[serde(default)]
    pub requests: RequestSettings,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl WorkflowDefinition {
    pub fn state(&self, name: &str) -> Option<&State> {
        self.index.get(name).map(|&i| &self.states[i])
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn command(&self, trigger: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.trigger == trigger)
    }

    /// Every action reachable from the definition, with a label for errors
    pub(super) fn actions(&self) -> impl Iterator<Item = (String, &Action)> {
        let state_actions = self.states.iter().flat_map(|s| {
            s.action
                .iter()
                .map(move |a| (format!("state `{}`", s.name), a))
        });
        let command_actions = self
            .commands
            .iter()
            .map(|c| (format!("command `{}`", c.trigger), &c.action));
        let group_actions = [
            ("group.reply_to_bot", &self.group.reply_to_bot),
            ("group.callback_query", &self.group.callback_query),
        ]
        .into_iter()
        .filter_map(|(label, hook)| hook.as_ref().map(|h| (label.to_string(), &h.action)));

        state_actions.chain(command_actions).chain(group_actions)
    }

    pub(super) fn set_index(&mut self, index: HashMap<String, usize>) {
        self.index = index;
    }
}
