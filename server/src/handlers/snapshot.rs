//! Snapshot handler - the full record set for a device reset.

use crate::db;
use crate::error::Result;
use sqlx::PgPool;
use tillsync_engine::SnapshotResponse;

/// Every record (tombstones included) and the clock they are consistent with.
pub async fn handle_snapshot(pool: &PgPool) -> Result<SnapshotResponse> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;

    let server_clock = db::current_clock(&mut *tx).await?;
    let rows = db::all_records(&mut *tx, server_clock).await?;
    tx.commit().await?;

    let records = db::to_remote_records(rows);
    tracing::info!(records = records.len(), server_clock, "snapshot served");
    Ok(SnapshotResponse {
        records,
        server_clock,
    })
}
