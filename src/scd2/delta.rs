// ABOUTME: Delta application from staging into the history table
// ABOUTME: Appends new versions and tombstones, then closes superseded validity intervals

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio_postgres::GenericClient;

use super::history::{LIVE_FLAG, OPEN_END_LITERAL, TOMBSTONE_FLAG};
use super::schema::TableContext;
use crate::error::{LoadError, Result};

/// Row counts produced by one delta application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeltaStats {
    /// New versions appended (inserts and updates)
    pub inserted: u64,
    /// Tombstones appended for keys gone from the source
    pub tombstoned: u64,
    /// Rows whose open interval was closed
    pub closed: u64,
}

impl DeltaStats {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.tombstoned == 0 && self.closed == 0
    }
}

fn prefixed(ctx: &TableContext, alias: &str) -> Vec<String> {
    ctx.target_column_list()
        .iter()
        .map(|c| format!("{}.{}", alias, c))
        .collect()
}

/// Append every staged row that matches no open, live history row on all columns.
///
/// ```sql
/// INSERT INTO hist (cols, effective_from)
/// SELECT s.cols, s.start_dt FROM stg s
/// WHERE NOT EXISTS (SELECT 1 FROM hist t WHERE <open, live> AND s.c IS NOT DISTINCT FROM t.c ...)
/// ```
pub fn build_insert_versions_query(ctx: &TableContext) -> String {
    let matches: Vec<String> = ctx
        .columns
        .iter()
        .map(|c| format!("{} IS NOT DISTINCT FROM {}", c.comparable("s"), c.comparable("t")))
        .collect();

    format!(
        "INSERT INTO {hist} ({cols}, effective_from) \
         SELECT {staged}, s.start_dt FROM {stg} s \
         WHERE NOT EXISTS (\
         SELECT 1 FROM {hist} t \
         WHERE t.effective_to = {end} AND t.deleted_flag = '{live}' AND {matches})",
        hist = ctx.history_relation(),
        cols = ctx.target_column_list().join(", "),
        staged = prefixed(ctx, "s").join(", "),
        stg = ctx.staging_relation(),
        end = OPEN_END_LITERAL,
        live = LIVE_FLAG,
        matches = matches.join(" AND ")
    )
}

/// Append a tombstone for every open, live history row whose key left the source.
///
/// Takes the apply time as `$1`. Keys match NULL-safely, so a NULL key still
/// present in the source is not tombstoned.
pub fn build_insert_tombstones_query(ctx: &TableContext) -> String {
    let key = &ctx.primary_key;
    format!(
        "INSERT INTO {hist} ({cols}, effective_from, deleted_flag) \
         SELECT {current}, CAST($1 AS timestamp(0)), '{tomb}' FROM {hist} t \
         WHERE t.effective_to = {end} AND t.deleted_flag = '{live}' \
         AND NOT EXISTS (SELECT 1 FROM {del} d WHERE {staged_key} IS NOT DISTINCT FROM {hist_key})",
        hist = ctx.history_relation(),
        cols = ctx.target_column_list().join(", "),
        current = prefixed(ctx, "t").join(", "),
        tomb = TOMBSTONE_FLAG,
        end = OPEN_END_LITERAL,
        live = LIVE_FLAG,
        del = ctx.delete_marker_relation(),
        staged_key = key.comparable("d"),
        hist_key = key.comparable("t")
    )
}

/// Close every open row that has a later open row of the same key.
///
/// The closed row ends one second before its nearest later successor starts.
/// NULL keys count as one key here too.
pub fn build_close_intervals_query(ctx: &TableContext) -> String {
    let key = &ctx.primary_key;
    let successor = format!(
        "FROM {hist} n WHERE {next_key} IS NOT DISTINCT FROM {this_key} \
         AND n.effective_to = {end} AND n.effective_from > h.effective_from",
        hist = ctx.history_relation(),
        next_key = key.comparable("n"),
        this_key = key.comparable("h"),
        end = OPEN_END_LITERAL
    );

    format!(
        "UPDATE {hist} h \
         SET effective_to = (SELECT MIN(n.effective_from) {successor}) - INTERVAL '1 second' \
         WHERE h.effective_to = {end} AND EXISTS (SELECT 1 {successor})",
        hist = ctx.history_relation(),
        successor = successor,
        end = OPEN_END_LITERAL
    )
}

/// Applies staged deltas to the history table.
pub struct DeltaApplier<'a, C: GenericClient> {
    client: &'a C,
}

impl<'a, C: GenericClient> DeltaApplier<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Run insert detection, delete detection and interval closing, in that order.
    ///
    /// Must run inside the transaction that staged the rows.
    pub async fn apply(&self, ctx: &TableContext, applied_at: NaiveDateTime) -> Result<DeltaStats> {
        let inserted = self
            .client
            .execute(&build_insert_versions_query(ctx), &[])
            .await
            .map_err(|e| LoadError::sql(format!("appending versions to {}", ctx.table), e))?;

        let tombstoned = self
            .client
            .execute(&build_insert_tombstones_query(ctx), &[&applied_at])
            .await
            .map_err(|e| LoadError::sql(format!("appending tombstones to {}", ctx.table), e))?;

        let closed = self
            .client
            .execute(&build_close_intervals_query(ctx), &[])
            .await
            .map_err(|e| LoadError::sql(format!("closing intervals of {}", ctx.table), e))?;

        let stats = DeltaStats {
            inserted,
            tombstoned,
            closed,
        };

        if stats.is_empty() {
            tracing::info!("No history changes for {}", ctx.table);
        } else {
            tracing::info!(
                "Applied delta to {}: {} inserted, {} tombstoned, {} closed",
                ctx.history_relation(),
                inserted,
                tombstoned,
                closed
            );
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scd2::schema::tests::accounts_context;

    #[test]
    fn test_insert_versions_null_safe_on_every_column() {
        let query = build_insert_versions_query(&accounts_context());
        assert!(query.starts_with(
            "INSERT INTO \"de10\".\"hist_accounts\" (\"account_num\", \"client\", \"valid_to\", effective_from) \
             SELECT s.\"account_num\", s.\"client\", s.\"valid_to\", s.start_dt FROM \"de10\".\"stg_accounts\" s"
        ));
        assert!(query.contains("s.\"account_num\" IS NOT DISTINCT FROM t.\"account_num\""));
        assert!(query.contains("s.\"client\" IS NOT DISTINCT FROM t.\"client\""));
        assert!(query.contains("s.\"valid_to\" IS NOT DISTINCT FROM t.\"valid_to\""));
        assert!(query.contains(
            "t.effective_to = TIMESTAMP '9999-12-31 00:00:00' AND t.deleted_flag = 'N'"
        ));
        assert!(!query.contains(" = s."));
    }

    #[test]
    fn test_tombstones_anti_join_on_key_set() {
        let query = build_insert_tombstones_query(&accounts_context());
        assert!(query.contains("CAST($1 AS timestamp(0)), 'Y'"));
        assert!(query.contains(
            "NOT EXISTS (SELECT 1 FROM \"de10\".\"stg_del_accounts\" d \
             WHERE d.\"account_num\" IS NOT DISTINCT FROM t.\"account_num\")"
        ));
        assert!(!query.contains("d.\"account_num\" = "));
        assert!(query.contains("t.deleted_flag = 'N'"));
    }

    #[test]
    fn test_close_intervals_uses_nearest_successor() {
        let query = build_close_intervals_query(&accounts_context());
        assert!(query.starts_with("UPDATE \"de10\".\"hist_accounts\" h SET effective_to = (SELECT MIN(n.effective_from)"));
        assert!(query.contains("- INTERVAL '1 second'"));
        assert!(query.contains("n.effective_from > h.effective_from"));
        assert!(query.contains("n.\"account_num\" IS NOT DISTINCT FROM h.\"account_num\""));
        assert!(!query.contains("n.\"account_num\" = "));
        assert!(query.contains("WHERE h.effective_to = TIMESTAMP '9999-12-31 00:00:00' AND EXISTS"));
    }

    #[test]
    fn test_delta_stats_empty() {
        assert!(DeltaStats::default().is_empty());
        assert!(!DeltaStats {
            inserted: 1,
            ..Default::default()
        }
        .is_empty());
    }
}
