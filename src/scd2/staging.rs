// ABOUTME: Staging loader for extracted rows and the source key set
// ABOUTME: Replaces staging and delete-marker contents with batched, parameterized inserts

use chrono::NaiveDateTime;
use tokio_postgres::types::ToSql;
use tokio_postgres::{GenericClient, Row};

use super::extractor::{column_value, row_start_dt, row_to_values, Extract, SqlValue};
use super::schema::TableContext;
use crate::error::{LoadError, Result};

// PostgreSQL accepts at most 65535 bind parameters per statement
const MAX_PARAMS: usize = 65000;

/// Result of replacing the staging contents for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedCounts {
    pub rows: u64,
    pub keys: u64,
    /// Greatest `start_dt` among staged rows
    pub max_start_dt: Option<NaiveDateTime>,
}

/// Build a multi-row insert into the staging table.
///
/// ```sql
/// INSERT INTO "tgt"."stg_t" ("a", "b", start_dt) VALUES ($1, $2, $3), ($4, $5, $6)
/// ```
pub fn build_staging_insert(ctx: &TableContext, num_rows: usize) -> String {
    let mut columns = ctx.target_column_list();
    columns.push("start_dt".to_string());
    let width = columns.len();

    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let base = row_idx * width;
            let mut placeholders: Vec<String> = ctx
                .columns
                .iter()
                .enumerate()
                .map(|(col_idx, c)| c.placeholder(base + col_idx + 1))
                .collect();
            placeholders.push(format!("${}", base + width));
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        ctx.staging_relation(),
        columns.join(", "),
        value_rows.join(", ")
    )
}

/// Build a multi-row insert into the delete-marker table.
pub fn build_delete_marker_insert(ctx: &TableContext, num_rows: usize) -> String {
    let value_rows: Vec<String> = (1..=num_rows)
        .map(|idx| format!("({})", ctx.primary_key.placeholder(idx)))
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        ctx.delete_marker_relation(),
        ctx.target_key(),
        value_rows.join(", ")
    )
}

fn check_shape(ctx: &TableContext, row_index: usize, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(LoadError::DataShapeMismatch {
            table: ctx.table.clone(),
            row_index,
            expected,
            actual,
        });
    }
    Ok(())
}

fn batch_size(params_per_row: usize) -> usize {
    std::cmp::max(1, MAX_PARAMS / params_per_row.max(1))
}

/// Writes staging and delete-marker contents in the target database.
pub struct StagingLoader<'a, C: GenericClient> {
    client: &'a C,
}

impl<'a, C: GenericClient> StagingLoader<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Empty the staging and delete-marker tables of `ctx`.
    pub async fn clear(&self, ctx: &TableContext) -> Result<()> {
        let sql = format!(
            "DELETE FROM {}; DELETE FROM {};",
            ctx.staging_relation(),
            ctx.delete_marker_relation()
        );
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| LoadError::sql(format!("clearing staging for {}", ctx.table), e))
    }

    /// Replace staging contents with an extract.
    ///
    /// Every row is shape-checked before anything is written.
    pub async fn replace(&self, ctx: &TableContext, extract: &Extract) -> Result<StagedCounts> {
        let width = ctx.columns.len() + 1;
        for (idx, row) in extract.rows.iter().enumerate() {
            check_shape(ctx, idx, width, row.len())?;
        }
        for (idx, row) in extract.keys.iter().enumerate() {
            check_shape(ctx, idx, 1, row.len())?;
        }

        let mut max_start_dt: Option<NaiveDateTime> = None;
        let mut values = Vec::with_capacity(extract.rows.len());
        for row in &extract.rows {
            max_start_dt = max_start_dt.max(row_start_dt(row, ctx)?);
            values.push(row_to_values(row, ctx)?);
        }

        let key = &ctx.primary_key;
        let keys = extract
            .keys
            .iter()
            .map(|row: &Row| column_value(row, 0, &key.column_type, &key.source_name))
            .collect::<Result<Vec<SqlValue>>>()?;

        self.clear(ctx).await?;
        let rows = self.insert_rows(ctx, values).await?;
        let keys = self.insert_keys(ctx, keys).await?;

        tracing::info!(
            "Staged {} rows and {} keys for {}",
            rows,
            keys,
            ctx.table
        );

        Ok(StagedCounts {
            rows,
            keys,
            max_start_dt,
        })
    }

    /// Insert already-converted rows (context columns followed by `start_dt`).
    pub async fn insert_rows(&self, ctx: &TableContext, rows: Vec<Vec<SqlValue>>) -> Result<u64> {
        let width = ctx.columns.len() + 1;
        for (idx, row) in rows.iter().enumerate() {
            check_shape(ctx, idx, width, row.len())?;
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let mut total = 0u64;
        for chunk in rows.chunks(batch_size(width)) {
            let query = build_staging_insert(ctx, chunk.len());
            total += self.execute_chunk(&query, chunk, ctx, "staging rows").await?;
        }
        Ok(total)
    }

    /// Insert primary key values into the delete-marker table.
    pub async fn insert_keys(&self, ctx: &TableContext, keys: Vec<SqlValue>) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut total = 0u64;
        for chunk in keys.chunks(batch_size(1)) {
            let query = build_delete_marker_insert(ctx, chunk.len());
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .map(|v| v.as_ref() as &(dyn ToSql + Sync))
                .collect();
            total += self
                .client
                .execute(&query, &params)
                .await
                .map_err(|e| LoadError::sql(format!("staging keys for {}", ctx.table), e))?;
        }
        Ok(total)
    }

    async fn execute_chunk(
        &self,
        query: &str,
        chunk: &[Vec<SqlValue>],
        ctx: &TableContext,
        what: &str,
    ) -> Result<u64> {
        let params: Vec<&(dyn ToSql + Sync)> = chunk
            .iter()
            .flat_map(|row| row.iter().map(|v| v.as_ref() as &(dyn ToSql + Sync)))
            .collect();

        self.client
            .execute(query, &params)
            .await
            .map_err(|e| LoadError::sql(format!("{} for {}", what, ctx.table), e))
    }
}
