//! Escalation log: queries the assistant could not answer.
//!
//! The query path only ever calls [`EscalationLog::record_escalation`]. The
//! remaining operations back the resolution workflow, where staff mark a
//! record `Finished` and leave remarks.
//!
//! Two backends:
//! - [`SqliteEscalationLog`]: the `escalated_queries` table in a SQLite file (WAL).
//! - [`InMemoryEscalationLog`]: process-local, for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::error::EscalationLogError;
use crate::models::{EscalationRecord, EscalationStatus, NewEscalation, NOT_PROVIDED};

/// Counts shown on the admin dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EscalationStats {
    #[serde(rename = "totalEscalated")]
    pub initiated: i64,
    #[serde(rename = "totalSolved")]
    pub finished: i64,
}

#[async_trait]
pub trait EscalationLog: Send + Sync {
    /// Append a record with status `Initiated` and return its id.
    async fn record_escalation(&self, entry: NewEscalation) -> Result<i64, EscalationLogError>;

    /// Set a record's status and remarks.
    async fn update_status(
        &self,
        id: i64,
        status: EscalationStatus,
        remarks: &str,
    ) -> Result<(), EscalationLogError>;

    /// Records in reverse recording order (newest first), optionally
    /// filtered by status. Timestamps are not compared, so records written
    /// under different UTC offsets still order correctly.
    async fn list(
        &self,
        status: Option<EscalationStatus>,
    ) -> Result<Vec<EscalationRecord>, EscalationLogError>;

    async fn stats(&self) -> Result<EscalationStats, EscalationLogError>;
}

fn or_not_provided(value: &Option<String>) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => NOT_PROVIDED.to_string(),
    }
}

fn new_record(id: i64, entry: NewEscalation) -> EscalationRecord {
    EscalationRecord {
        id,
        timestamp: entry.timestamp.to_rfc3339(),
        user_name: or_not_provided(&entry.requester.name),
        email: or_not_provided(&entry.requester.email),
        phone_number: or_not_provided(&entry.requester.phone),
        query_text: entry.query_text,
        bot_response: entry.answer_text,
        status: EscalationStatus::Initiated,
        remarks: String::new(),
        category: entry.category.as_str().to_string(),
    }
}

// ============ SQLite ============

pub struct SqliteEscalationLog {
    pool: SqlitePool,
}

impl SqliteEscalationLog {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self, EscalationLogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| EscalationLogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let log = Self { pool };
        log.migrate().await?;
        Ok(log)
    }

    async fn migrate(&self) -> Result<(), EscalationLogError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS escalated_queries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                user_name TEXT,
                email TEXT,
                phone_number TEXT,
                query_text TEXT NOT NULL,
                bot_response TEXT NOT NULL,
                status TEXT NOT NULL,
                remarks TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Databases created before categorization lack the column.
        let category_columns: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('escalated_queries') WHERE name = 'category'",
        )
        .fetch_one(&self.pool)
        .await?;
        if category_columns == 0 {
            sqlx::query("ALTER TABLE escalated_queries ADD COLUMN category TEXT NOT NULL DEFAULT 'General'")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_escalated_status ON escalated_queries(status)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<EscalationRecord, EscalationLogError> {
    let status: String = row.get("status");
    let status = EscalationStatus::from_str(&status).map_err(|e| sqlx::Error::Decode(e.into()))?;
    Ok(EscalationRecord {
        id: row.get("id"),
        timestamp: row.get("timestamp"),
        user_name: row
            .get::<Option<String>, _>("user_name")
            .unwrap_or_else(|| NOT_PROVIDED.to_string()),
        email: row
            .get::<Option<String>, _>("email")
            .unwrap_or_else(|| NOT_PROVIDED.to_string()),
        phone_number: row
            .get::<Option<String>, _>("phone_number")
            .unwrap_or_else(|| NOT_PROVIDED.to_string()),
        query_text: row.get("query_text"),
        bot_response: row.get("bot_response"),
        status,
        remarks: row.get::<Option<String>, _>("remarks").unwrap_or_default(),
        category: row.get("category"),
    })
}

#[async_trait]
impl EscalationLog for SqliteEscalationLog {
    async fn record_escalation(&self, entry: NewEscalation) -> Result<i64, EscalationLogError> {
        let record = new_record(0, entry);
        let result = sqlx::query(
            r#"
            INSERT INTO escalated_queries
                (timestamp, user_name, email, phone_number, query_text, bot_response, status, remarks, category)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.timestamp)
        .bind(&record.user_name)
        .bind(&record.email)
        .bind(&record.phone_number)
        .bind(&record.query_text)
        .bind(&record.bot_response)
        .bind(record.status.as_str())
        .bind(&record.remarks)
        .bind(&record.category)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_status(
        &self,
        id: i64,
        status: EscalationStatus,
        remarks: &str,
    ) -> Result<(), EscalationLogError> {
        let result = sqlx::query("UPDATE escalated_queries SET status = ?, remarks = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(remarks)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EscalationLogError::NotFound(id));
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<EscalationStatus>,
    ) -> Result<Vec<EscalationRecord>, EscalationLogError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM escalated_queries WHERE status = ? ORDER BY id DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM escalated_queries ORDER BY id DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_record).collect()
    }

    async fn stats(&self) -> Result<EscalationStats, EscalationLogError> {
        let initiated: i64 =
            sqlx::query_scalar("SELECT COUNT(id) FROM escalated_queries WHERE status = 'Initiated'")
                .fetch_one(&self.pool)
                .await?;
        let finished: i64 =
            sqlx::query_scalar("SELECT COUNT(id) FROM escalated_queries WHERE status = 'Finished'")
                .fetch_one(&self.pool)
                .await?;
        Ok(EscalationStats {
            initiated,
            finished,
        })
    }
}

// ============ In-memory ============

#[derive(Default)]
pub struct InMemoryEscalationLog {
    records: Mutex<Vec<EscalationRecord>>,
}

impl InMemoryEscalationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// All records in insertion order.
    pub fn records(&self) -> Vec<EscalationRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl EscalationLog for InMemoryEscalationLog {
    async fn record_escalation(&self, entry: NewEscalation) -> Result<i64, EscalationLogError> {
        let mut records = self.records.lock();
        let id = records.len() as i64 + 1;
        records.push(new_record(id, entry));
        Ok(id)
    }

    async fn update_status(
        &self,
        id: i64,
        status: EscalationStatus,
        remarks: &str,
    ) -> Result<(), EscalationLogError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(EscalationLogError::NotFound(id))?;
        record.status = status;
        record.remarks = remarks.to_string();
        Ok(())
    }

    async fn list(
        &self,
        status: Option<EscalationStatus>,
    ) -> Result<Vec<EscalationRecord>, EscalationLogError> {
        let mut records: Vec<EscalationRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    async fn stats(&self) -> Result<EscalationStats, EscalationLogError> {
        let records = self.records.lock();
        let count = |s: EscalationStatus| records.iter().filter(|r| r.status == s).count() as i64;
        Ok(EscalationStats {
            initiated: count(EscalationStatus::Initiated),
            finished: count(EscalationStatus::Finished),
        })
    }
}
