//! Webhook ingress
//!
//! The chat platform posts updates here; each one is queued on its chat's
//! serializer lane and acknowledged without waiting for processing.

mod handlers;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::interpreter::Interpreter;
use crate::runtime::UpdateSerializer;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub interpreter: Arc<Interpreter>,
    pub serializer: Arc<UpdateSerializer>,
    /// Path secret the platform was registered with
    webhook_secret: Arc<str>,
}

impl AppState {
    pub fn new(interpreter: Arc<Interpreter>, webhook_secret: &str) -> Self {
        Self {
            interpreter,
            serializer: Arc::new(UpdateSerializer::new()),
            webhook_secret: Arc::from(webhook_secret),
        }
    }

    /// Whether a webhook path names this bot with the right secret
    pub fn authenticates(&self, bot: &str, secret: &str) -> bool {
        bot == self.interpreter.bot() && secret == &*self.webhook_secret
    }
}
