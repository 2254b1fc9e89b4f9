//! Push handler - admits changes sent by devices.

use crate::db;
use crate::error::{AppError, Result};
use sqlx::PgPool;
use tillsync_engine::{
    protocol::{admit, Admission},
    AcceptedChange, Change, PushRequest, PushResponse, RejectedChange, Schema,
};

/// Reject requests the server cannot process at all.
pub fn check_push_request(schema: &Schema, request: &PushRequest, max_changes: usize) -> Result<()> {
    if request.schema_version != schema.version {
        return Err(AppError::SchemaMismatch(format!(
            "server schema is version {}, device {} sent {}",
            schema.version, request.device_id, request.schema_version
        )));
    }
    if request.changes.len() > max_changes {
        return Err(AppError::BadRequest(format!(
            "push carries {} changes; at most {} allowed",
            request.changes.len(),
            max_changes
        )));
    }
    Ok(())
}

/// Process a push request from a device.
///
/// The whole batch runs in one transaction. Per-change outcomes travel in
/// the response; only infrastructure failures fail the request.
pub async fn handle_push(
    pool: &PgPool,
    schema: &Schema,
    request: PushRequest,
    max_changes: usize,
) -> Result<PushResponse> {
    check_push_request(schema, &request, max_changes)?;

    if request.changes.is_empty() {
        let server_clock = db::current_clock(pool).await?;
        return Ok(PushResponse {
            server_clock,
            ..PushResponse::default()
        });
    }

    let mut tx = pool.begin().await?;
    db::lock_writes(&mut tx).await?;

    let mut response = PushResponse::default();
    for change in &request.changes {
        let current = db::get_record_for_update(&mut tx, change.entity_type, &change.entity_id)
            .await?
            .map(|row| row.to_state())
            .transpose()?;

        match admit(schema, current.as_ref(), change) {
            Admission::Duplicate {
                version,
                server_clock,
            } => {
                tracing::debug!(change_id = %change.change_id, "duplicate change acknowledged");
                response.accepted.push(accepted(change, version, server_clock));
            }
            Admission::Apply {
                version,
                payload,
                deleted,
            } => {
                let record = db::write_record(
                    &mut tx,
                    change.entity_type,
                    &change.entity_id,
                    &payload,
                    deleted,
                    version,
                    &change.change_id,
                )
                .await?;
                response
                    .accepted
                    .push(accepted(change, record.version, record.server_clock));
            }
            Admission::Reject {
                reason,
                message,
                current,
            } => {
                tracing::debug!(
                    entity_type = %change.entity_type,
                    entity_id = %change.entity_id,
                    ?reason,
                    "change rejected"
                );
                response.rejected.push(RejectedChange {
                    entity_type: change.entity_type,
                    entity_id: change.entity_id.clone(),
                    change_id: change.change_id.clone(),
                    reason,
                    message,
                    current,
                });
            }
        }
    }

    response.server_clock = db::current_clock(&mut *tx).await?;
    tx.commit().await?;

    tracing::info!(
        device_id = %request.device_id,
        accepted = response.accepted.len(),
        rejected = response.rejected.len(),
        "push processed"
    );
    Ok(response)
}

fn accepted(change: &Change, version: u64, server_clock: u64) -> AcceptedChange {
    AcceptedChange {
        entity_type: change.entity_type,
        entity_id: change.entity_id.clone(),
        change_id: change.change_id.clone(),
        version,
        server_clock,
    }
}
