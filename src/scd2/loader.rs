// ABOUTME: Per-table load orchestration inside one target transaction
// ABOUTME: Provisions, extracts, stages, applies deltas and commits the watermark for each table

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio_postgres::{Client, GenericClient, Transaction};

use super::ddl;
use super::delta::{DeltaApplier, DeltaStats};
use super::extractor::ChangeExtractor;
use super::schema::{introspect, Schemas, TableContext, TableSpec};
use super::staging::StagingLoader;
use super::watermark::{Watermark, WatermarkStore};
use crate::error::{LoadError, Result};

/// Format accepted for an explicit apply time.
pub const APPLY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of parsing a user-supplied timestamp.
///
/// Keeps the raw text of an unparseable value so callers decide how to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTimestamp {
    Valid(NaiveDateTime),
    InvalidFormat(String),
}

impl ParsedTimestamp {
    pub fn parse(raw: &str) -> Self {
        match NaiveDateTime::parse_from_str(raw.trim(), APPLY_TIME_FORMAT) {
            Ok(ts) => ParsedTimestamp::Valid(ts),
            Err(_) => ParsedTimestamp::InvalidFormat(raw.to_string()),
        }
    }
}

/// Summary of one successful table load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub table: String,
    pub watermark_before: Watermark,
    pub watermark_after: Watermark,
    pub staged_rows: u64,
    pub staged_keys: u64,
    pub delta: DeltaStats,
}

/// Historize one table.
///
/// Introspects the source, commits the table's DDL, then runs staging, delta
/// application and the watermark update in a single target transaction. Any
/// failure inside that transaction rolls it back and surfaces as
/// [`LoadError::TransactionAborted`].
pub async fn provision_and_load<S: GenericClient>(
    spec: &TableSpec,
    schemas: &Schemas,
    source: &S,
    target: &mut Client,
    applied_at: NaiveDateTime,
) -> Result<LoadStats> {
    let ctx = introspect(source, spec, schemas).await?;

    let ddl_tx = target
        .transaction()
        .await
        .map_err(|e| LoadError::sql(format!("starting DDL transaction for {}", ctx.table), e))?;
    ddl::provision(&ddl_tx, &ctx).await?;
    ddl_tx
        .commit()
        .await
        .map_err(|e| LoadError::sql(format!("committing DDL for {}", ctx.table), e))?;

    let tx = target
        .transaction()
        .await
        .map_err(|e| LoadError::aborted(&ctx.table, LoadError::sql("starting load transaction", e)))?;

    match load_in_transaction(&tx, source, &ctx, applied_at).await {
        Ok(stats) => {
            tx.commit()
                .await
                .map_err(|e| LoadError::aborted(&ctx.table, LoadError::sql("committing load", e)))?;
            tracing::info!(
                "Committed {}: watermark {} -> {}",
                ctx.table,
                stats.watermark_before,
                stats.watermark_after
            );
            Ok(stats)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!("Rollback of {} failed: {}", ctx.table, rollback_err);
            }
            Err(LoadError::aborted(&ctx.table, e))
        }
    }
}

async fn load_in_transaction<S: GenericClient>(
    tx: &Transaction<'_>,
    source: &S,
    ctx: &TableContext,
    applied_at: NaiveDateTime,
) -> Result<LoadStats> {
    let store = WatermarkStore::new(tx, &ctx.schemas.target);
    let before = store.get(&ctx.schemas.source, &ctx.table).await?;

    let extract = ChangeExtractor::new(source).extract(ctx, &before).await?;
    let staged = StagingLoader::new(tx).replace(ctx, &extract).await?;
    let delta = DeltaApplier::new(tx).apply(ctx, applied_at).await?;

    let after = before.advance(staged.max_start_dt);
    if after != before {
        let updated = store.set(&ctx.schemas.source, &ctx.table, after).await?;
        if updated == 0 {
            tracing::warn!("No watermark row for {}.{}", ctx.schemas.source, ctx.table);
        }
    }

    Ok(LoadStats {
        table: ctx.table.clone(),
        watermark_before: before,
        watermark_after: after,
        staged_rows: staged.rows,
        staged_keys: staged.keys,
        delta,
    })
}

/// Runs [`provision_and_load`] over a list of tables, one at a time.
pub struct Historizer {
    source: Client,
    target: Client,
    schemas: Schemas,
}

impl Historizer {
    pub fn new(source: Client, target: Client, schemas: Schemas) -> Self {
        Self {
            source,
            target,
            schemas,
        }
    }

    /// Historize `tables` in order, stopping at the first failure.
    ///
    /// Tables committed before the failure stay committed.
    pub async fn run(
        &mut self,
        tables: &[TableSpec],
        applied_at: NaiveDateTime,
    ) -> Result<Vec<LoadStats>> {
        let mut results = Vec::with_capacity(tables.len());

        for (idx, spec) in tables.iter().enumerate() {
            tracing::info!(
                "Historizing {}.{} ({}/{})",
                self.schemas.source,
                spec.name,
                idx + 1,
                tables.len()
            );

            match provision_and_load(spec, &self.schemas, &self.source, &mut self.target, applied_at)
                .await
            {
                Ok(stats) => results.push(stats),
                Err(e) => {
                    tracing::error!("Historization of {} failed: {}", spec.name, e.format_detailed());
                    return Err(e);
                }
            }
        }

        Ok(results)
    }
}
