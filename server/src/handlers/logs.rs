//! Sync log handlers - devices ship their audit trail here.

use crate::db::{self, LogFilter};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tillsync_engine::{LogStatus, SyncLogEntry};

/// Default and maximum number of entries returned by a listing.
const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

/// Upper bound on entries accepted in one append.
pub const MAX_APPEND: usize = 5000;

/// Response for an append.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub appended: u64,
}

/// Query parameters for listing logs.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub device_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// Response for a listing.
#[derive(Debug, Serialize)]
pub struct LogListResponse {
    pub entries: Vec<SyncLogEntry>,
}

/// Store entries shipped by a device.
pub async fn handle_append_logs(pool: &PgPool, entries: Vec<SyncLogEntry>) -> Result<AppendResponse> {
    if entries.len() > MAX_APPEND {
        return Err(AppError::BadRequest(format!(
            "at most {MAX_APPEND} log entries per request"
        )));
    }
    if entries.is_empty() {
        return Ok(AppendResponse { appended: 0 });
    }

    let appended = db::insert_logs(pool, &entries).await?;
    tracing::debug!(appended, "sync log entries stored");
    Ok(AppendResponse { appended })
}

/// Parse a listing query without touching the database.
pub fn parse_log_query(query: &LogQuery) -> Result<(Option<LogStatus>, i64)> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<LogStatus>)
        .transpose()?;
    let limit = query.limit.map(|l| l.clamp(1, MAX_LIMIT)).unwrap_or(DEFAULT_LIMIT);
    Ok((status, limit))
}

/// Most recent entries, newest first.
pub async fn handle_list_logs(pool: &PgPool, query: LogQuery) -> Result<LogListResponse> {
    let (status, limit) = parse_log_query(&query)?;
    let filter = LogFilter {
        device_id: query.device_id.as_deref(),
        status,
        limit,
    };

    let rows = db::list_logs(pool, &filter).await?;
    let entries = rows
        .iter()
        .filter_map(|row| match row.to_entry() {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping malformed log row: {}", e);
                None
            }
        })
        .collect();

    Ok(LogListResponse { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_query_defaults() {
        let (status, limit) = parse_log_query(&LogQuery::default()).unwrap();
        assert_eq!(status, None);
        assert_eq!(limit, DEFAULT_LIMIT);
    }

    #[test]
    fn log_query_validates_status() {
        let query = LogQuery {
            status: Some("failed".into()),
            limit: Some(5_000),
            ..LogQuery::default()
        };
        assert_eq!(parse_log_query(&query).unwrap(), (Some(LogStatus::Failed), MAX_LIMIT));

        let query = LogQuery {
            status: Some("meh".into()),
            ..LogQuery::default()
        };
        assert!(matches!(parse_log_query(&query), Err(AppError::Engine(_))));
    }
}
