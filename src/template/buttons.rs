//! Inline button extraction
//!
//! Legacy prose carries its keyboard as a trailing `[[A, B][C]]` segment:
//! each inner `[...]` group is a row, comma-separated entries are columns.
//! A column's literal text is its callback payload; its label is the same
//! text after slot substitution.

use super::{render, SlotLookup};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

/// Trailing button segment: from the first `[[` to a closing `]` at the end
static SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\s*\[\[.*\]\s*$").expect("segment pattern is valid"));

/// A well-formed segment: an outer bracket wrapping one or more row groups
static WELL_FORMED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*(?:\[[^\[\]]*\]\s*)+\]$").expect("layout pattern is valid")
});

static ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]*)\]").expect("row pattern is valid"));

/// Raw button rows: each entry is a column payload, possibly with slots
pub type ButtonLayout = Vec<Vec<String>>;

/// Rendered keyboard
pub type Keyboard = Vec<Vec<Button>>;

/// A single inline button
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

impl Button {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("malformed button segment: {0}")]
    MalformedButtons(String),
}

/// Split prose from its trailing button segment, if any.
///
/// Stripping is idempotent: the prose half never contains `[[`, so a second
/// split of it finds nothing.
pub fn split_buttons(text: &str) -> (&str, Option<&str>) {
    match SEGMENT.find(text) {
        Some(m) => {
            let (prose, segment) = text.split_at(m.start());
            (prose, Some(segment.trim()))
        }
        None => (text, None),
    }
}

/// Remove the trailing button segment from a text
pub fn strip_buttons(text: &str) -> &str {
    split_buttons(text).0
}

/// Parse a `[[A, B][C]]` segment into rows of column payloads
pub fn parse_layout(segment: &str) -> Result<ButtonLayout, TemplateError> {
    if !WELL_FORMED.is_match(segment) {
        return Err(TemplateError::MalformedButtons(segment.to_string()));
    }

    Ok(ROW
        .captures_iter(segment)
        .map(|caps| {
            caps[1]
                .split(',')
                .map(|column| column.trim().to_string())
                .collect()
        })
        .collect())
}

/// Render a layout into a keyboard.
///
/// Labels are rendered against `store`; empty labels drop their column and
/// rows left without columns are dropped. With `remove_duplicates`, a label
/// already emitted anywhere in this keyboard is skipped.
pub fn render_keyboard(
    layout: &ButtonLayout,
    store: &impl SlotLookup,
    remove_duplicates: bool,
) -> Keyboard {
    let mut seen: Vec<String> = Vec::new();
    let mut keyboard = Vec::new();

    for row in layout {
        let mut buttons = Vec::new();
        for column in row {
            let label = render(column, store, "");
            if label.is_empty() || (remove_duplicates && seen.contains(&label)) {
                continue;
            }
            seen.push(label.clone());
            buttons.push(Button::new(label, column.clone()));
        }
        if !buttons.is_empty() {
            keyboard.push(buttons);
        }
    }

    keyboard
}

/// Extract and render the keyboard embedded in free text.
///
/// Malformed segments degrade to an empty keyboard and are logged.
pub fn extract_buttons(text: &str, store: &impl SlotLookup, remove_duplicates: bool) -> Keyboard {
    let Some(segment) = split_buttons(text).1 else {
        return Vec::new();
    };

    match parse_layout(segment) {
        Ok(layout) => render_keyboard(&layout, store, remove_duplicates),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed button segment");
            Vec::new()
        }
    }
}
