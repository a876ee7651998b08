//! Message text with a structured keyboard

use crate::template::{self, ButtonLayout, Keyboard, SlotLookup};
use serde::{Deserialize, Serialize};

/// A message body plus its button rows.
///
/// In JSON either `{"text": "...", "buttons": [["A", "B"], ["C"]]}` or a
/// plain string. A plain string is imported by lifting its trailing
/// `[[...]]` segment into `buttons`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawPrompt")]
pub struct Prompt {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: ButtonLayout,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPrompt {
    Legacy(String),
    Structured {
        text: String,
        #[serde(default)]
        buttons: ButtonLayout,
    },
}

impl From<RawPrompt> for Prompt {
    fn from(raw: RawPrompt) -> Self {
        match raw {
            RawPrompt::Legacy(text) => Prompt::from_legacy(&text),
            RawPrompt::Structured { text, buttons } => Prompt { text, buttons },
        }
    }
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: ButtonLayout) -> Self {
        self.buttons = buttons;
        self
    }

    /// Import free text carrying an embedded button segment
    pub fn from_legacy(text: &str) -> Self {
        let (prose, segment) = template::split_buttons(text);
        let buttons = match segment.map(template::parse_layout) {
            Some(Ok(layout)) => layout,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Importing prompt without buttons");
                Vec::new()
            }
            None => Vec::new(),
        };
        Self {
            text: prose.to_string(),
            buttons,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.buttons.is_empty()
    }

    /// Render text and keyboard against a slot store
    pub fn render(&self, store: &impl SlotLookup, default: &str) -> (String, Keyboard) {
        (
            template::render(&self.text, store, default),
            template::render_keyboard(&self.buttons, store, true),
        )
    }
}
