//! Load-time checks of a workflow definition

use super::{Action, WorkflowDefinition};
use crate::extensions::{ExtensionOp, ExtensionRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to read workflow {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid workflow JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate state name: {0}")]
    DuplicateState(String),
    #[error("Start state `{0}` is not defined")]
    MissingStartState(String),
    #[error("{context} refers to unknown state `{target}`")]
    UnknownState { context: String, target: String },
    #[error("{context} calls `{method}`, which is not registered")]
    UnregisteredMethod {
        context: String,
        method: ExtensionOp,
    },
    #[error("{context} has an invalid pattern: {source}")]
    BadPattern {
        context: String,
        source: regex::Error,
    },
}

/// Index states, compile patterns and check every reference.
pub(super) fn validate(
    definition: &mut WorkflowDefinition,
    registry: &ExtensionRegistry,
) -> Result<(), DefinitionError> {
    let mut index = HashMap::new();
    for (i, state) in definition.states.iter().enumerate() {
        if index.insert(state.name.clone(), i).is_some() {
            return Err(DefinitionError::DuplicateState(state.name.clone()));
        }
    }
    definition.set_index(index);

    if !definition.has_state(&definition.start_state) {
        return Err(DefinitionError::MissingStartState(
            definition.start_state.clone(),
        ));
    }

    for state in &mut definition.states {
        let context = format!("state `{}`", state.name);
        state
            .compile()
            .map_err(|source| DefinitionError::BadPattern { context, source })?;
    }
    definition
        .requests
        .compile()
        .map_err(|source| DefinitionError::BadPattern {
            context: "requests".to_string(),
            source,
        })?;

    let check = |context: &str, target: &str| {
        if definition.has_state(target) {
            Ok(())
        } else {
            Err(DefinitionError::UnknownState {
                context: context.to_string(),
                target: target.to_string(),
            })
        }
    };

    for state in &definition.states {
        for transition in &state.transitions {
            check(&format!("state `{}` transition", state.name), &transition.to)?;
        }
    }

    for (context, action) in definition.actions() {
        for target in action.targets() {
            check(&context, target)?;
        }
        if let Action::CallFunction { method, .. } = action {
            if !registry.contains(*method) {
                return Err(DefinitionError::UnregisteredMethod {
                    context,
                    method: *method,
                });
            }
        }
    }

    let requests = &definition.requests;
    for target in [&requests.duplicate_state, &requests.forward_state]
        .into_iter()
        .flatten()
    {
        check("requests", target)?;
    }

    Ok(())
}
