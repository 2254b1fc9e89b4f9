//! Database operations for the sync_logs table.

use sqlx::{PgPool, Row};
use tillsync_engine::{LogStatus, SyncLogEntry};

/// Filters for listing sync logs.
#[derive(Debug, Default)]
pub struct LogFilter<'a> {
    pub device_id: Option<&'a str>,
    pub status: Option<LogStatus>,
    pub limit: i64,
}

/// A stored log row from the database.
#[derive(Debug)]
pub struct StoredLog {
    pub device_id: String,
    pub sync_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub operation: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredLog {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredLog {
            device_id: row.try_get("device_id")?,
            sync_type: row.try_get("sync_type")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            operation: row.try_get("operation")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StoredLog {
    pub fn to_entry(&self) -> Result<SyncLogEntry, tillsync_engine::Error> {
        Ok(SyncLogEntry {
            device_id: self.device_id.clone(),
            sync_type: self.sync_type.parse()?,
            entity_type: self.entity_type.as_deref().map(str::parse).transpose()?,
            entity_id: self.entity_id.clone(),
            operation: self.operation.as_deref().map(str::parse).transpose()?,
            status: self.status.parse()?,
            error_message: self.error_message.clone(),
            created_at: self.created_at.max(0) as u64,
        })
    }
}

/// Append log entries in one transaction. Returns the number inserted.
pub async fn insert_logs(pool: &PgPool, entries: &[SyncLogEntry]) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0;

    for entry in entries {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_logs (
                device_id, sync_type, entity_type, entity_id,
                operation, status, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&entry.device_id)
        .bind(entry.sync_type.as_str())
        .bind(entry.entity_type.map(|t| t.as_str()))
        .bind(entry.entity_id.as_deref())
        .bind(entry.operation.map(|o| o.as_str()))
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(entry.created_at as i64)
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected();
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Most recent log entries matching `filter`, newest first.
pub async fn list_logs(pool: &PgPool, filter: &LogFilter<'_>) -> Result<Vec<StoredLog>, sqlx::Error> {
    sqlx::query_as::<_, StoredLog>(
        r#"
        SELECT device_id, sync_type, entity_type, entity_id,
               operation, status, error_message, created_at
        FROM sync_logs
        WHERE ($1::TEXT IS NULL OR device_id = $1)
          AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY id DESC
        LIMIT $3
        "#,
    )
    .bind(filter.device_id)
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.limit)
    .fetch_all(pool)
    .await
}
