//! Process configuration from environment variables

use crate::telegram::ChatId;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_WORKFLOW: &str = "workflows/request_intake.json";
const DEFAULT_RECORD_SHEET: &str = "requests";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var} has invalid value `{value}`")]
    Invalid { var: &'static str, value: String },
}

/// Bot credentials registered with the chat platform
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub username: String,
    pub token: String,
    /// Path secret expected on webhook calls
    pub webhook_secret: String,
    /// Group where admin threads are posted
    pub admin_chat_id: ChatId,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub workflow_path: PathBuf,
    pub db_path: PathBuf,
    pub record_sheet: String,
    pub bot: BotConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            get(var)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let port = match get("CHATFLOW_PORT") {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    var: "CHATFLOW_PORT",
                    value,
                })?,
            None => DEFAULT_PORT,
        };

        let db_path = get("CHATFLOW_DB_PATH").map_or_else(
            || {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".chatflow").join("requests.db")
            },
            PathBuf::from,
        );

        let admin_chat = required("TELEGRAM_ADMIN_GROUP_CHAT_ID")?;
        let admin_chat_id = admin_chat.trim().parse().map_err(|_| ConfigError::Invalid {
            var: "TELEGRAM_ADMIN_GROUP_CHAT_ID",
            value: admin_chat.clone(),
        })?;

        Ok(Self {
            port,
            workflow_path: get("CHATFLOW_WORKFLOW")
                .map_or_else(|| PathBuf::from(DEFAULT_WORKFLOW), PathBuf::from),
            db_path,
            record_sheet: get("CHATFLOW_RECORD_SHEET")
                .unwrap_or_else(|| DEFAULT_RECORD_SHEET.to_string()),
            bot: BotConfig {
                username: required("TELEGRAM_BOT_USERNAME")?,
                token: required("TELEGRAM_BOT_TOKEN")?,
                webhook_secret: required("TELEGRAM_BOT_SECRET")?,
                admin_chat_id,
                api_base: get("TELEGRAM_API_BASE"),
            },
        })
    }
}
