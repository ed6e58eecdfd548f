// ABOUTME: History table conventions and read-side queries
// ABOUTME: Open-end sentinel, point-in-time reconstruction and the open-row invariant audit

use chrono::{NaiveDate, NaiveDateTime};
use tokio_postgres::{GenericClient, Row};

use super::schema::TableContext;
use crate::error::{LoadError, Result};

/// SQL literal for the open end of a validity interval.
pub const OPEN_END_LITERAL: &str = "TIMESTAMP '9999-12-31 00:00:00'";

/// Open end of a validity interval, matching [`OPEN_END_LITERAL`].
pub fn open_end() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Value of `deleted_flag` on regular history rows.
pub const LIVE_FLAG: &str = "N";
/// Value of `deleted_flag` on tombstones.
pub const TOMBSTONE_FLAG: &str = "Y";

/// Query returning the table state valid at `$1`.
///
/// Uses the inclusive interpretation `effective_from <= t <= effective_to`;
/// closed intervals end one second before their successor starts, so no
/// instant belongs to two rows. Keys whose valid row at `t` is a tombstone
/// are omitted.
pub fn build_snapshot_at_query(ctx: &TableContext) -> String {
    let columns: Vec<String> = ctx
        .target_column_list()
        .iter()
        .map(|c| format!("h.{}", c))
        .collect();

    format!(
        "SELECT {} FROM {} h \
         WHERE h.effective_from <= $1 AND h.effective_to >= $1 AND h.deleted_flag = '{}' \
         ORDER BY h.{}",
        columns.join(", "),
        ctx.history_relation(),
        LIVE_FLAG,
        ctx.target_key()
    )
}

/// Query returning keys that hold more than one open row.
pub fn build_open_row_violations_query(ctx: &TableContext) -> String {
    format!(
        "SELECT CAST(h.{key} AS text), COUNT(*) FROM {hist} h \
         WHERE h.effective_to = {end} AND h.deleted_flag = '{live}' \
         GROUP BY h.{key} HAVING COUNT(*) > 1 \
         ORDER BY 1",
        key = ctx.target_key(),
        hist = ctx.history_relation(),
        end = OPEN_END_LITERAL,
        live = LIVE_FLAG
    )
}

/// Reconstruct the table state at `at` from history.
pub async fn snapshot_at<C: GenericClient>(
    client: &C,
    ctx: &TableContext,
    at: NaiveDateTime,
) -> Result<Vec<Row>> {
    client
        .query(&build_snapshot_at_query(ctx), &[&at])
        .await
        .map_err(|e| LoadError::sql(format!("reading {} as of {}", ctx.table, at), e))
}

/// Keys (as text, `None` for a NULL key) violating the single-open-row invariant,
/// with their open row count.
pub async fn open_row_violations<C: GenericClient>(
    client: &C,
    ctx: &TableContext,
) -> Result<Vec<(Option<String>, i64)>> {
    let rows = client
        .query(&build_open_row_violations_query(ctx), &[])
        .await
        .map_err(|e| LoadError::sql(format!("auditing open rows of {}", ctx.table), e))?;

    Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
}
