//! Trait abstractions for runtime I/O
//!
//! These traits let the request lifecycle run against mock stores in tests.

use crate::db::{Database, Record, RecordResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Identifies the row an update applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    pub column: String,
    pub value: String,
}

impl RecordKey {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Durable tabular mirror of request state
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Prepare a sheet with its column headers
    async fn init(&self, sheet: &str, headers: &[String]) -> RecordResult<()>;

    async fn append_record(&self, sheet: &str, row: &Record) -> RecordResult<()>;

    /// Merge `patch` into the row matching `key`
    async fn update_record(&self, sheet: &str, key: &RecordKey, patch: &Record) -> RecordResult<()>;
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn init(&self, sheet: &str, headers: &[String]) -> RecordResult<()> {
        (**self).init(sheet, headers).await
    }

    async fn append_record(&self, sheet: &str, row: &Record) -> RecordResult<()> {
        (**self).append_record(sheet, row).await
    }

    async fn update_record(&self, sheet: &str, key: &RecordKey, patch: &Record) -> RecordResult<()> {
        (**self).update_record(sheet, key, patch).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use `Database` as a `RecordStore`
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Database,
}

impl SqliteRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn init(&self, sheet: &str, headers: &[String]) -> RecordResult<()> {
        match self.db.sheet_headers(sheet)? {
            Some(existing) if existing != headers => {
                tracing::info!(sheet, old = ?existing, new = ?headers, "Replacing sheet headers");
            }
            Some(_) => {}
            None => tracing::info!(sheet, columns = headers.len(), "Creating sheet"),
        }
        self.db.init_sheet(sheet, headers)
    }

    async fn append_record(&self, sheet: &str, row: &Record) -> RecordResult<()> {
        self.db.append_row(sheet, row)
    }

    async fn update_record(&self, sheet: &str, key: &RecordKey, patch: &Record) -> RecordResult<()> {
        let updated = self.db.update_row(sheet, &key.column, &key.value, patch)?;
        if !updated {
            tracing::warn!(
                sheet,
                column = %key.column,
                value = %key.value,
                "No record matches key, update skipped"
            );
        }
        Ok(())
    }
}
