//! chatflow - chat workflow interpreter
//!
//! Drives per-chat conversations through a JSON-defined workflow and runs
//! a request lifecycle between users and an admin group.

mod api;
mod config;
mod db;
mod extensions;
mod interpreter;
mod runtime;
mod session;
mod telegram;
mod template;
mod transport;
mod workflow;

use api::{create_router, AppState};
use config::AppConfig;
use db::Database;
use extensions::ExtensionRegistry;
use interpreter::{Interpreter, Services};
use runtime::SqliteRecordStore;
use session::GlobalStore;
use std::net::SocketAddr;
use std::sync::Arc;
use telegram::TelegramClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::LoggingTransport;
use workflow::WorkflowDefinition;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatflow=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env().inspect_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
    })?;

    // Workflow definition, validated against the registered operations
    let registry = ExtensionRegistry::request_lifecycle();
    let definition = WorkflowDefinition::load(&config.workflow_path, &registry).inspect_err(|e| {
        tracing::error!(path = %config.workflow_path.display(), error = %e, "Invalid workflow");
    })?;

    // Request record mirror
    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    let client = TelegramClient::new(&config.bot.token, config.bot.api_base.as_deref())?;
    let services = Services {
        transport: Arc::new(LoggingTransport::new(Arc::new(client))),
        records: Arc::new(SqliteRecordStore::new(db)),
        admin_chat_id: config.bot.admin_chat_id,
        record_sheet: config.record_sheet.clone(),
    };

    let interpreter = Interpreter::new(
        config.bot.username.clone(),
        Arc::new(definition),
        registry,
        services,
        GlobalStore::shared(),
    );
    interpreter.initialize().await?;

    let state = AppState::new(Arc::new(interpreter), &config.bot.webhook_secret);
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(bot = %config.bot.username, "chatflow listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
