//! Durable mirror of request records
//!
//! Rows are JSON objects grouped by sheet name, so the column set can grow
//! with the workflow without migrations.

mod schema;

use schema::SCHEMA;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Malformed record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type RecordResult<T> = Result<T, RecordError>;

/// A record row: column name to value
pub type Record = Map<String, Value>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> RecordResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> RecordResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> RecordResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Create a sheet or replace its headers
    pub fn init_sheet(&self, sheet: &str, headers: &[String]) -> RecordResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sheets (name, headers, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET headers = excluded.headers",
            params![sheet, serde_json::to_string(headers)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn sheet_headers(&self, sheet: &str) -> RecordResult<Option<Vec<String>>> {
        let conn = self.conn.lock().unwrap();
        let headers: Option<String> = conn
            .query_row(
                "SELECT headers FROM sheets WHERE name = ?1",
                params![sheet],
                |row| row.get(0),
            )
            .optional()?;
        headers
            .map(|h| serde_json::from_str(&h).map_err(RecordError::from))
            .transpose()
    }

    /// Append a row to a sheet
    pub fn append_row(&self, sheet: &str, row: &Record) -> RecordResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO records (sheet, data, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![sheet, serde_json::to_string(row)?, now],
        )?;
        Ok(())
    }

    /// Merge `patch` into the first row whose `column` equals `value`.
    ///
    /// Returns false when no row matched.
    pub fn update_row(
        &self,
        sheet: &str,
        column: &str,
        value: &str,
        patch: &Record,
    ) -> RecordResult<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, data FROM records WHERE sheet = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![sheet], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (id, data) in rows {
            let mut record: Record = serde_json::from_str(&data)?;
            if record.get(column).and_then(Value::as_str) != Some(value) {
                continue;
            }
            for (k, v) in patch {
                record.insert(k.clone(), v.clone());
            }
            conn.execute(
                "UPDATE records SET data = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&record)?, Utc::now().to_rfc3339(), id],
            )?;
            return Ok(true);
        }

        Ok(false)
    }

    /// All rows of a sheet in insertion order
    pub fn rows(&self, sheet: &str) -> RecordResult<Vec<Record>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM records WHERE sheet = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![sheet], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(RecordError::from))
            .collect()
    }
}
