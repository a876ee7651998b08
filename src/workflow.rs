//! Declarative conversation workflows
//!
//! A workflow is loaded once from JSON, validated against the registered
//! extension operations, and then shared read-only by every session.

mod definition;
mod prompt;
mod settings;
mod validate;

pub use definition::{
    Action, SlotCaptures, SlotSource, State, Transition, WorkflowDefinition, WILDCARD,
};
pub use prompt::Prompt;
pub use settings::{GroupSettings, RequestSettings};
pub use validate::DefinitionError;

use crate::extensions::ExtensionRegistry;
use std::path::Path;

impl WorkflowDefinition {
    /// Parse and validate a workflow document
    pub fn from_json(json: &str, registry: &ExtensionRegistry) -> Result<Self, DefinitionError> {
        let mut definition: WorkflowDefinition = serde_json::from_str(json)?;
        validate::validate(&mut definition, registry)?;
        Ok(definition)
    }

    /// Read, parse and validate a workflow file
    pub fn load(path: impl AsRef<Path>, registry: &ExtensionRegistry) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let definition = Self::from_json(&json, registry)?;
        tracing::info!(
            path = %path.display(),
            states = definition.states.len(),
            commands = definition.commands.len(),
            "Loaded workflow"
        );
        Ok(definition)
    }
}
