//! API request and response types

use serde::{Deserialize, Serialize};

/// Acknowledgement returned to the platform for every accepted update
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookResponse {
    pub ok: bool,
}

impl WebhookResponse {
    pub fn accepted() -> Self {
        Self { ok: true }
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
