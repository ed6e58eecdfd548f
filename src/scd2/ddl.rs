// ABOUTME: DDL provisioning for staging, history and delete-marker tables
// ABOUTME: Idempotent CREATE IF NOT EXISTS plus a guarded watermark bootstrap row

use tokio_postgres::GenericClient;

use super::history::{LIVE_FLAG, OPEN_END_LITERAL};
use super::schema::TableContext;
use crate::error::{LoadError, Result};

fn column_definitions(ctx: &TableContext) -> Vec<String> {
    ctx.columns
        .iter()
        .map(|c| format!("{} {}", crate::utils::quote_ident(&c.target_name), c.ddl_type()))
        .collect()
}

/// Metadata table holding one watermark row per (schema, table).
pub fn build_meta_table_ddl(ctx: &TableContext) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         schema_name varchar(63) NOT NULL, \
         table_name varchar(63) NOT NULL, \
         update_dt timestamp(0))",
        ctx.meta_relation()
    )
}

pub fn build_staging_ddl(ctx: &TableContext) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, start_dt timestamp(0))",
        ctx.staging_relation(),
        column_definitions(ctx).join(", ")
    )
}

pub fn build_history_ddl(ctx: &TableContext) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, \
         effective_from timestamp(0), \
         effective_to timestamp(0) DEFAULT {}, \
         deleted_flag char(1) DEFAULT '{}')",
        ctx.history_relation(),
        column_definitions(ctx).join(", "),
        OPEN_END_LITERAL,
        LIVE_FLAG
    )
}

pub fn build_delete_marker_ddl(ctx: &TableContext) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({} {})",
        ctx.delete_marker_relation(),
        ctx.target_key(),
        ctx.primary_key.ddl_type()
    )
}

/// Insert the never-loaded watermark row unless one already exists.
///
/// Deliberately not an upsert: an existing watermark must survive.
pub fn build_watermark_bootstrap(ctx: &TableContext) -> String {
    format!(
        "INSERT INTO {meta} (schema_name, table_name, update_dt) \
         SELECT CAST($1 AS varchar), CAST($2 AS varchar), NULL \
         WHERE NOT EXISTS (\
         SELECT 1 FROM {meta} WHERE schema_name = CAST($1 AS varchar) AND table_name = CAST($2 AS varchar))",
        meta = ctx.meta_relation()
    )
}

/// Create the table's target objects and its watermark row.
///
/// The caller commits before any data movement for the table.
pub async fn provision<C: GenericClient>(client: &C, ctx: &TableContext) -> Result<()> {
    let statements = [
        ("creating metadata table", build_meta_table_ddl(ctx)),
        ("creating staging table", build_staging_ddl(ctx)),
        ("creating history table", build_history_ddl(ctx)),
        ("creating delete-marker table", build_delete_marker_ddl(ctx)),
    ];

    for (action, sql) in &statements {
        tracing::debug!("{}: {}", action, sql);
        client
            .batch_execute(sql)
            .await
            .map_err(|e| LoadError::sql(format!("{} for {}", action, ctx.table), e))?;
    }

    let inserted = client
        .execute(
            &build_watermark_bootstrap(ctx),
            &[&ctx.schemas.source, &ctx.table],
        )
        .await
        .map_err(|e| LoadError::sql(format!("bootstrapping watermark for {}", ctx.table), e))?;

    if inserted > 0 {
        tracing::info!(
            "Provisioned target tables for {}.{} (first load)",
            ctx.schemas.target,
            ctx.table
        );
    } else {
        tracing::debug!("Target tables for {} already provisioned", ctx.table);
    }

    Ok(())
}
