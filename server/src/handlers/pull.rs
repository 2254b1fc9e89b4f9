//! Pull handler - serves records written since a device's watermark.

use crate::db;
use crate::error::Result;
use sqlx::PgPool;
use tillsync_engine::{PullQuery, PullResponse, RemoteRecord, ServerClock};

/// Default limit for pull requests.
pub const DEFAULT_LIMIT: u32 = 200;

/// Maximum limit for pull requests.
pub const MAX_LIMIT: u32 = 1000;

/// Process a pull request from a device.
pub async fn handle_pull(pool: &PgPool, query: PullQuery) -> Result<PullResponse> {
    let limit = effective_limit(query.limit);
    let since = query.since.unwrap_or(0);

    // Pin the upper bound first so rows committed mid-request wait for the next pull.
    let head = db::current_clock(pool).await?;
    let rows = db::records_between(pool, since, head, i64::from(limit) + 1).await?;

    Ok(page(db::to_remote_records(rows), limit, since, head))
}

pub fn effective_limit(requested: Option<u32>) -> u32 {
    requested.map(|l| l.clamp(1, MAX_LIMIT)).unwrap_or(DEFAULT_LIMIT)
}

/// Cut `records` (fetched with one extra row) down to a page.
///
/// The returned clock is the watermark the device should send next: the last
/// record served when more remain, otherwise the head of the log.
pub fn page(
    mut records: Vec<RemoteRecord>,
    limit: u32,
    since: ServerClock,
    head: ServerClock,
) -> PullResponse {
    let has_more = records.len() > limit as usize;
    records.truncate(limit as usize);

    let server_clock = if has_more {
        records.last().map_or(since, |r| r.server_clock)
    } else {
        head.max(since)
    };

    PullResponse {
        records,
        server_clock,
        has_more,
    }
}
