// ABOUTME: Change extraction from the source table
// ABOUTME: Reads rows changed since the watermark plus the complete current key set

use chrono::NaiveDateTime;
use tokio_postgres::types::ToSql;
use tokio_postgres::{GenericClient, Row};

use super::schema::{ColumnType, TableContext, CREATED_COLUMN, UPDATED_COLUMN};
use super::watermark::Watermark;
use crate::error::{LoadError, Result};
use crate::utils::quote_ident;

/// Boxed parameter value bound into target inserts.
pub type SqlValue = Box<dyn ToSql + Sync + Send>;

/// Source expression for a row's last change, at the source's own precision.
pub fn changed_at_expr() -> String {
    format!(
        "COALESCE({}, {})",
        quote_ident(UPDATED_COLUMN),
        quote_ident(CREATED_COLUMN)
    )
}

/// Source expression for a row's validity start, truncated to the whole
/// seconds stored in the target.
///
/// Truncation keeps `start_dt` at or below the raw change time, so a watermark
/// taken from staged rows never passes a later change within the same second.
pub fn start_dt_expr() -> String {
    format!(
        "CAST(date_trunc('second', {}) AS timestamp(0))",
        changed_at_expr()
    )
}

/// Build the change query.
///
/// Projects every context column in context order followed by `start_dt`.
/// With a watermark the query takes it as `$1` and compares it against the
/// untruncated change time, so sub-second changes after the watermark's second
/// are still picked up.
pub fn build_changes_query(ctx: &TableContext, watermark: &Watermark) -> String {
    let projections: Vec<String> = ctx.columns.iter().map(|c| c.select_expr()).collect();

    let mut query = format!(
        "SELECT {}, {} AS start_dt FROM {}",
        projections.join(", "),
        start_dt_expr(),
        ctx.source_relation()
    );

    if let Watermark::LoadedAt(_) = watermark {
        query.push_str(&format!(" WHERE {} > $1", changed_at_expr()));
    }

    query
}

/// Build the query returning every primary key currently in the source.
pub fn build_keys_query(ctx: &TableContext) -> String {
    format!(
        "SELECT {} FROM {}",
        ctx.primary_key.select_expr(),
        ctx.source_relation()
    )
}

/// Rows pulled from the source for one run.
pub struct Extract {
    /// Changed rows: context columns followed by `start_dt`
    pub rows: Vec<Row>,
    /// Every primary key present in the source
    pub keys: Vec<Row>,
}

/// Reads changed rows and the key set from the source database.
pub struct ChangeExtractor<'a, C: GenericClient> {
    client: &'a C,
}

impl<'a, C: GenericClient> ChangeExtractor<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Read rows changed after the watermark (all rows when never loaded).
    pub async fn read_changes(
        &self,
        ctx: &TableContext,
        watermark: &Watermark,
    ) -> Result<Vec<Row>> {
        let query = build_changes_query(ctx, watermark);
        tracing::debug!("Change query for {}: {}", ctx.table, query);

        let result = match watermark {
            Watermark::NeverLoaded => self.client.query(&query, &[]).await,
            Watermark::LoadedAt(since) => self.client.query(&query, &[since]).await,
        };

        result.map_err(|e| LoadError::sql(format!("extracting changes from {}", ctx.table), e))
    }

    /// Read the complete current primary key set, regardless of the watermark.
    pub async fn read_keys(&self, ctx: &TableContext) -> Result<Vec<Row>> {
        self.client
            .query(&build_keys_query(ctx), &[])
            .await
            .map_err(|e| LoadError::sql(format!("extracting keys from {}", ctx.table), e))
    }

    /// Read both halves of a run's extract.
    pub async fn extract(&self, ctx: &TableContext, watermark: &Watermark) -> Result<Extract> {
        let rows = self.read_changes(ctx, watermark).await?;
        let keys = self.read_keys(ctx).await?;

        tracing::info!(
            "Extracted {} changed rows and {} keys from {}.{} (watermark: {})",
            rows.len(),
            keys.len(),
            ctx.schemas.source,
            ctx.table,
            watermark
        );

        Ok(Extract { rows, keys })
    }
}

fn decode<'r, T>(row: &'r Row, idx: usize, column: &str) -> Result<T>
where
    T: tokio_postgres::types::FromSql<'r>,
{
    row.try_get(idx)
        .map_err(|e| LoadError::sql(format!("decoding column {}", column), e))
}

/// Decode one source value into a bindable parameter according to its normalized type.
pub fn column_value(
    row: &Row,
    idx: usize,
    column_type: &ColumnType,
    name: &str,
) -> Result<SqlValue> {
    let value: SqlValue = match column_type {
        ColumnType::SmallInt => Box::new(decode::<Option<i16>>(row, idx, name)?),
        ColumnType::Integer => Box::new(decode::<Option<i32>>(row, idx, name)?),
        ColumnType::BigInt => Box::new(decode::<Option<i64>>(row, idx, name)?),
        ColumnType::Real => Box::new(decode::<Option<f32>>(row, idx, name)?),
        ColumnType::Double => Box::new(decode::<Option<f64>>(row, idx, name)?),
        ColumnType::Boolean => Box::new(decode::<Option<bool>>(row, idx, name)?),
        ColumnType::Numeric | ColumnType::Varchar | ColumnType::Text | ColumnType::Other(_) => {
            Box::new(decode::<Option<String>>(row, idx, name)?)
        }
        ColumnType::Date => Box::new(decode::<Option<chrono::NaiveDate>>(row, idx, name)?),
        ColumnType::Time => Box::new(decode::<Option<chrono::NaiveTime>>(row, idx, name)?),
        ColumnType::Timestamp => Box::new(decode::<Option<NaiveDateTime>>(row, idx, name)?),
        ColumnType::TimestampTz => Box::new(decode::<
            Option<chrono::DateTime<chrono::Utc>>,
        >(row, idx, name)?),
        ColumnType::Uuid => Box::new(decode::<Option<uuid::Uuid>>(row, idx, name)?),
        ColumnType::Json | ColumnType::Jsonb => {
            Box::new(decode::<Option<serde_json::Value>>(row, idx, name)?)
        }
        ColumnType::Bytea => Box::new(decode::<Option<Vec<u8>>>(row, idx, name)?),
    };
    Ok(value)
}

/// Convert a changed row into staging parameters: context columns, then `start_dt`.
///
/// The caller checks the row's arity first.
pub fn row_to_values(row: &Row, ctx: &TableContext) -> Result<Vec<SqlValue>> {
    let mut values = Vec::with_capacity(ctx.columns.len() + 1);
    for (idx, column) in ctx.columns.iter().enumerate() {
        values.push(column_value(row, idx, &column.column_type, &column.source_name)?);
    }
    let start_dt: Option<NaiveDateTime> = decode(row, ctx.columns.len(), "start_dt")?;
    values.push(Box::new(start_dt));
    Ok(values)
}

/// `start_dt` of a changed row.
pub fn row_start_dt(row: &Row, ctx: &TableContext) -> Result<Option<NaiveDateTime>> {
    decode(row, ctx.columns.len(), "start_dt")
}
