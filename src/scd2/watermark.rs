// ABOUTME: Watermark store for incremental historization
// ABOUTME: Persists the last applied source timestamp per (schema, table) in the target metadata table

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio_postgres::GenericClient;

use crate::error::{LoadError, Result};
use crate::utils::quote_qualified;

/// Last source timestamp fully incorporated into history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Watermark {
    /// No successful load yet; the next extraction is a full one
    NeverLoaded,
    /// Rows with `start_dt` after this instant are pending
    LoadedAt(NaiveDateTime),
}

impl Watermark {
    /// Interpret the nullable `update_dt` metadata column.
    pub fn from_stored(value: Option<NaiveDateTime>) -> Self {
        match value {
            Some(ts) => Watermark::LoadedAt(ts),
            None => Watermark::NeverLoaded,
        }
    }

    pub fn as_stored(&self) -> Option<NaiveDateTime> {
        match self {
            Watermark::LoadedAt(ts) => Some(*ts),
            Watermark::NeverLoaded => None,
        }
    }

    /// Watermark after a run whose staged rows peaked at `staged_max`.
    ///
    /// A run that staged nothing (or only rows without a timestamp) leaves
    /// the watermark unchanged; it never moves backwards.
    pub fn advance(self, staged_max: Option<NaiveDateTime>) -> Self {
        match (self, staged_max) {
            (current, None) => current,
            (Watermark::NeverLoaded, Some(ts)) => Watermark::LoadedAt(ts),
            (Watermark::LoadedAt(current), Some(ts)) => Watermark::LoadedAt(current.max(ts)),
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Watermark::NeverLoaded => write!(f, "never loaded"),
            Watermark::LoadedAt(ts) => write!(f, "{}", ts),
        }
    }
}

/// Reads and writes watermark rows in `<target-schema>.meta_loads`.
pub struct WatermarkStore<'a, C: GenericClient> {
    client: &'a C,
    meta_relation: String,
}

impl<'a, C: GenericClient> WatermarkStore<'a, C> {
    /// Create a store over the metadata table of `target_schema`.
    ///
    /// `target_schema` must already be validated.
    pub fn new(client: &'a C, target_schema: &str) -> Self {
        Self {
            client,
            meta_relation: quote_qualified(target_schema, "meta_loads"),
        }
    }

    /// Current watermark of `schema.table`.
    ///
    /// A missing metadata row reads as [`Watermark::NeverLoaded`].
    pub async fn get(&self, schema: &str, table: &str) -> Result<Watermark> {
        let query = format!(
            "SELECT update_dt FROM {} WHERE schema_name = $1 AND table_name = $2",
            self.meta_relation
        );

        let row = self
            .client
            .query_opt(&query, &[&schema, &table])
            .await
            .map_err(|e| LoadError::sql(format!("reading watermark of {}.{}", schema, table), e))?;

        let stored: Option<NaiveDateTime> = row.and_then(|r| r.get(0));
        Ok(Watermark::from_stored(stored))
    }

    /// Persist `value` for `schema.table`.
    ///
    /// Returns the number of metadata rows updated (0 when the table was never
    /// provisioned).
    pub async fn set(&self, schema: &str, table: &str, value: Watermark) -> Result<u64> {
        let query = format!(
            "UPDATE {} SET update_dt = $3 WHERE schema_name = $1 AND table_name = $2",
            self.meta_relation
        );

        let stored = value.as_stored();
        self.client
            .execute(&query, &[&schema, &table, &stored])
            .await
            .map_err(|e| LoadError::sql(format!("advancing watermark of {}.{}", schema, table), e))
    }
}
