//! Message templating
//!
//! Flat `{slot}` interpolation against a slot store plus extraction of the
//! legacy `[[A, B][C]]` inline button syntax embedded in prose.

mod buttons;


pub use buttons::{
    extract_buttons, parse_layout, render_keyboard, split_buttons, strip_buttons, Button,
    ButtonLayout, Keyboard,
};

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// `{ path }` where path is a dotted identifier
static SLOT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\s*([\w.]+)\s*\}").expect("slot pattern is valid"));

/// Read access to named slot values, addressed by dotted path
pub trait SlotLookup {
    fn slot(&self, path: &str) -> Option<&str>;
}

impl SlotLookup for BTreeMap<String, String> {
    fn slot(&self, path: &str) -> Option<&str> {
        self.get(path).map(String::as_str)
    }
}

impl<T: SlotLookup + ?Sized> SlotLookup for &T {
    fn slot(&self, path: &str) -> Option<&str> {
        (**self).slot(path)
    }
}

/// Substitute every `{slot}` placeholder in `template`.
///
/// Missing or empty slots are replaced by `default`. This is a single
/// left-to-right pass: substituted values are never rescanned, so a value
/// that itself contains braces is emitted verbatim.
pub fn render(template: &str, store: &impl SlotLookup, default: &str) -> String {
    SLOT_PATTERN
        .replace_all(template, |caps: &Captures| match store.slot(&caps[1]) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => default.to_string(),
        })
        .into_owned()
}

/// Slot paths referenced by a template, in order of appearance
pub fn slot_names(text: &str) -> Vec<&str> {
    SLOT_PATTERN
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}
