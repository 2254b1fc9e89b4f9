//! Database operations for the records table.
//!
//! Every write draws the next value of `server_clock_seq`. Writers hold a
//! transaction-scoped advisory lock, so clock values become visible in
//! order and a pull can never skip a record committed late.

use sqlx::{PgConnection, PgPool, Row};
use tillsync_engine::{
    protocol::RemoteState, EntityType, RemoteRecord, ServerClock, Version,
};

/// Advisory lock key serializing writers.
const WRITE_LOCK_KEY: i64 = 0x7411_5e7c;

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub deleted: bool,
    pub version: i64,
    pub server_clock: i64,
    pub last_change_id: Option<String>,
    #[allow(dead_code)]
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            payload: row.try_get("payload")?,
            deleted: row.try_get("deleted")?,
            version: row.try_get("version")?,
            server_clock: row.try_get("server_clock")?,
            last_change_id: row.try_get("last_change_id")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredRecord {
    /// Convert database row to the wire representation.
    pub fn to_remote(&self) -> Result<RemoteRecord, tillsync_engine::Error> {
        Ok(RemoteRecord {
            entity_type: self.entity_type.parse()?,
            id: self.entity_id.clone(),
            payload: self.payload.clone(),
            deleted: self.deleted,
            version: self.version as Version,
            server_clock: self.server_clock as ServerClock,
        })
    }

    /// Current state as seen by the admission rules.
    pub fn to_state(&self) -> Result<RemoteState, tillsync_engine::Error> {
        Ok(RemoteState {
            record: self.to_remote()?,
            last_change_id: self.last_change_id.clone(),
        })
    }
}

/// Convert rows, skipping (and logging) any with an unknown entity type.
pub fn to_remote_records(rows: Vec<StoredRecord>) -> Vec<RemoteRecord> {
    rows.into_iter()
        .filter_map(|row| match row.to_remote() {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping stored record {}: {}", row.entity_id, e);
                None
            }
        })
        .collect()
}

/// Serialize writers for the rest of the transaction.
pub async fn lock_writes(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(WRITE_LOCK_KEY)
        .execute(conn)
        .await?;
    Ok(())
}

/// Get a record by type and id, locking the row.
pub async fn get_record_for_update(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(
        r#"
        SELECT entity_type, entity_id, payload, deleted, version,
               server_clock, last_change_id, updated_at
        FROM records
        WHERE entity_type = $1 AND entity_id = $2
        FOR UPDATE
        "#,
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .fetch_optional(conn)
    .await
}

/// Insert or overwrite a record with the next server clock value.
pub async fn write_record(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: &str,
    payload: &serde_json::Value,
    deleted: bool,
    version: Version,
    change_id: &str,
) -> Result<RemoteRecord, sqlx::Error> {
    let server_clock: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO records (
            entity_type, entity_id, payload, deleted, version,
            server_clock, last_change_id, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, nextval('server_clock_seq'), $6, NOW())
        ON CONFLICT (entity_type, entity_id) DO UPDATE SET
            payload = EXCLUDED.payload,
            deleted = EXCLUDED.deleted,
            version = EXCLUDED.version,
            server_clock = EXCLUDED.server_clock,
            last_change_id = EXCLUDED.last_change_id,
            updated_at = EXCLUDED.updated_at
        RETURNING server_clock
        "#,
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(payload)
    .bind(deleted)
    .bind(version as i64)
    .bind(change_id)
    .fetch_one(conn)
    .await?;

    Ok(RemoteRecord {
        entity_type,
        id: entity_id.to_string(),
        payload: payload.clone(),
        deleted,
        version,
        server_clock: server_clock as ServerClock,
    })
}

/// Highest server clock value committed so far.
pub async fn current_clock<'e, E>(executor: E) -> Result<ServerClock, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let clock: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(server_clock), 0) FROM records")
        .fetch_one(executor)
        .await?;
    Ok(clock as ServerClock)
}

/// Records with `since < server_clock <= until`, oldest first.
pub async fn records_between(
    pool: &PgPool,
    since: ServerClock,
    until: ServerClock,
    limit: i64,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(
        r#"
        SELECT entity_type, entity_id, payload, deleted, version,
               server_clock, last_change_id, updated_at
        FROM records
        WHERE server_clock > $1 AND server_clock <= $2
        ORDER BY server_clock ASC
        LIMIT $3
        "#,
    )
    .bind(since as i64)
    .bind(until as i64)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Every record up to `until`, tombstones included.
pub async fn all_records<'e, E>(executor: E, until: ServerClock) -> Result<Vec<StoredRecord>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, StoredRecord>(
        r#"
        SELECT entity_type, entity_id, payload, deleted, version,
               server_clock, last_change_id, updated_at
        FROM records
        WHERE server_clock <= $1
        ORDER BY server_clock ASC
        "#,
    )
    .bind(until as i64)
    .fetch_all(executor)
    .await
}
