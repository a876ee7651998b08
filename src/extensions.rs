//! Extension operations callable from workflows
//!
//! Workflows name operations through a closed [`ExtensionOp`] enum. The
//! registry maps each operation to its implementation once at start-up and
//! the definition loader rejects operations that are not registered.

mod requests;
mod threads;

pub use requests::RequestLifecycle;

use crate::db::RecordError;
use crate::interpreter::Services;
use crate::session::{ChatSession, SharedGlobalStore};
use crate::telegram::Update;
use crate::transport::TransportError;
use crate::workflow::WorkflowDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Every operation a workflow may call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ExtensionOp {
    /// Prepare the record sheet
    Init,
    SubmitForm,
    /// User reply on a request thread
    AppendUserForm,
    CancelRequest,
    /// Admin reply on a request thread
    AppendAdminForm,
    CloseRequest,
    ValidateForwardTemplate,
    CheckDuplicate,
    ConfirmDuplicateUpdate,
    UpdateDuplicate,
}

impl ExtensionOp {
    pub const ALL: [ExtensionOp; 10] = [
        ExtensionOp::Init,
        ExtensionOp::SubmitForm,
        ExtensionOp::AppendUserForm,
        ExtensionOp::CancelRequest,
        ExtensionOp::AppendAdminForm,
        ExtensionOp::CloseRequest,
        ExtensionOp::ValidateForwardTemplate,
        ExtensionOp::CheckDuplicate,
        ExtensionOp::ConfirmDuplicateUpdate,
        ExtensionOp::UpdateDuplicate,
    ];

    /// Method name used in workflow JSON
    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionOp::Init => "init",
            ExtensionOp::SubmitForm => "submitForm",
            ExtensionOp::AppendUserForm => "appendUserForm",
            ExtensionOp::CancelRequest => "cancelRequest",
            ExtensionOp::AppendAdminForm => "appendAdminForm",
            ExtensionOp::CloseRequest => "closeRequest",
            ExtensionOp::ValidateForwardTemplate => "validateForwardTemplate",
            ExtensionOp::CheckDuplicate => "checkDuplicate",
            ExtensionOp::ConfirmDuplicateUpdate => "confirmDuplicateUpdate",
            ExtensionOp::UpdateDuplicate => "updateDuplicate",
        }
    }
}

impl fmt::Display for ExtensionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown extension method `{0}`")]
pub struct UnknownOp(pub String);

impl FromStr for ExtensionOp {
    type Err = UnknownOp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnknownOp(s.to_string()))
    }
}

impl TryFrom<String> for ExtensionOp {
    type Error = UnknownOp;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for ExtensionOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("{0}: no request id on the referenced message")]
    MissingRequestId(ExtensionOp),
    #[error("Unknown request: {0}")]
    UnknownRequest(String),
    #[error("{0}")]
    Rejected(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Record store error: {0}")]
    Records(#[from] RecordError),
}

/// Everything an extension function may read or mutate
pub struct ExtensionContext<'a> {
    pub update: &'a Update,
    pub session: &'a mut ChatSession,
    pub global: &'a SharedGlobalStore,
    pub definition: &'a WorkflowDefinition,
    pub services: &'a Services,
}

/// A business operation plugged into the interpreter.
///
/// `Ok(Some(state))` names the next state, `Ok(None)` defers to the
/// action's `on_success`, and `Err` routes to its `on_failure`.
#[async_trait]
pub trait ExtensionFunction: Send + Sync {
    async fn call(&self, ctx: &mut ExtensionContext<'_>) -> Result<Option<String>, ExtensionError>;
}

/// Operation to implementation map, built once at start-up
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    functions: HashMap<ExtensionOp, Arc<dyn ExtensionFunction>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every request lifecycle operation
    pub fn request_lifecycle() -> Self {
        ExtensionOp::ALL
            .into_iter()
            .fold(Self::new(), |registry, op| {
                registry.with(op, Arc::new(RequestLifecycle::new(op)))
            })
    }

    pub fn with(mut self, op: ExtensionOp, function: Arc<dyn ExtensionFunction>) -> Self {
        self.register(op, function);
        self
    }

    pub fn register(&mut self, op: ExtensionOp, function: Arc<dyn ExtensionFunction>) {
        self.functions.insert(op, function);
    }

    pub fn get(&self, op: ExtensionOp) -> Option<Arc<dyn ExtensionFunction>> {
        self.functions.get(&op).cloned()
    }

    pub fn contains(&self, op: ExtensionOp) -> bool {
        self.functions.contains_key(&op)
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.functions.keys().map(|op| op.as_str()).collect();
        ops.sort_unstable();
        f.debug_struct("ExtensionRegistry").field("ops", &ops).finish()
    }
}
