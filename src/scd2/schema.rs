// ABOUTME: Schema introspection for historized tables
// ABOUTME: Builds the per-table context (sorted, typed, renamed columns) every later step consumes

use std::collections::BTreeMap;

use serde::Deserialize;
use tokio_postgres::GenericClient;

use crate::error::{LoadError, Result};
use crate::utils::{quote_ident, quote_qualified, validate_postgres_identifier};

/// Source housekeeping column holding the creation timestamp.
pub const CREATED_COLUMN: &str = "create_dt";
/// Source housekeeping column holding the last update timestamp.
pub const UPDATED_COLUMN: &str = "update_dt";

/// Columns the engine adds to target tables; source columns may not be renamed onto them.
pub const RESERVED_TARGET_COLUMNS: [&str; 4] =
    ["start_dt", "effective_from", "effective_to", "deleted_flag"];

/// One table to historize, as supplied by the orchestrator.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name in the source schema
    pub name: String,
    /// Primary key column name in the source table
    pub primary_key: String,
    /// Source column name -> target column name
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

impl TableSpec {
    pub fn new(name: &str, primary_key: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: primary_key.to_string(),
            rename: BTreeMap::new(),
        }
    }

    pub fn with_rename(mut self, source: &str, target: &str) -> Self {
        self.rename.insert(source.to_string(), target.to_string());
        self
    }
}

/// Source and target schema names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schemas {
    pub source: String,
    pub target: String,
}

impl Schemas {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

/// Normalized column type.
///
/// Types without a native binding travel through their text representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Real,
    Double,
    Boolean,
    /// Every character type (`character`, `character varying`)
    Varchar,
    Text,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Jsonb,
    Bytea,
    /// Any other type; holds the SQL type name used in DDL and casts
    Other(String),
}

impl ColumnType {
    /// Normalize an `information_schema.columns` entry.
    ///
    /// `udt_name` names arrays and user-defined types, which `data_type`
    /// reports only as `ARRAY` / `USER-DEFINED`.
    pub fn from_information_schema(data_type: &str, udt_name: &str) -> Result<Self> {
        let normalized = match data_type {
            "smallint" => ColumnType::SmallInt,
            "integer" => ColumnType::Integer,
            "bigint" => ColumnType::BigInt,
            "numeric" => ColumnType::Numeric,
            "real" => ColumnType::Real,
            "double precision" => ColumnType::Double,
            "boolean" => ColumnType::Boolean,
            "character varying" | "character" => ColumnType::Varchar,
            "text" => ColumnType::Text,
            "date" => ColumnType::Date,
            "time without time zone" => ColumnType::Time,
            "timestamp without time zone" => ColumnType::Timestamp,
            "timestamp with time zone" => ColumnType::TimestampTz,
            "uuid" => ColumnType::Uuid,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            "bytea" => ColumnType::Bytea,
            "ARRAY" | "USER-DEFINED" => {
                validate_postgres_identifier(udt_name)?;
                ColumnType::Other(quote_ident(udt_name))
            }
            other => {
                if other.is_empty()
                    || !other
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c == ' ')
                {
                    return Err(LoadError::InvalidIdentifier(format!(
                        "unsupported column type '{}'",
                        other
                    )));
                }
                ColumnType::Other(other.to_string())
            }
        };
        Ok(normalized)
    }

    /// True for character types, which are right-trimmed on extraction.
    pub fn is_character(&self) -> bool {
        matches!(self, ColumnType::Varchar)
    }

    fn type_name(&self) -> &str {
        match self {
            ColumnType::SmallInt => "smallint",
            ColumnType::Integer => "integer",
            ColumnType::BigInt => "bigint",
            ColumnType::Numeric => "numeric",
            ColumnType::Real => "real",
            ColumnType::Double => "double precision",
            ColumnType::Boolean => "boolean",
            ColumnType::Varchar => "varchar",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::Timestamp => "timestamp",
            ColumnType::TimestampTz => "timestamptz",
            ColumnType::Uuid => "uuid",
            ColumnType::Json => "json",
            ColumnType::Jsonb => "jsonb",
            ColumnType::Bytea => "bytea",
            ColumnType::Other(name) => name,
        }
    }
}

/// One historized column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub source_name: String,
    pub target_name: String,
    pub column_type: ColumnType,
    /// Character length, when the source declares one
    pub length: Option<i32>,
}

impl ColumnSpec {
    /// Type as written in target DDL.
    pub fn ddl_type(&self) -> String {
        match (&self.column_type, self.length) {
            (ColumnType::Varchar, Some(len)) => format!("varchar({})", len),
            (column_type, _) => column_type.type_name().to_string(),
        }
    }

    /// Projection used when reading the column from the source.
    ///
    /// `numeric` travels as text: its range and `NaN` do not fit a fixed-width decimal.
    pub fn select_expr(&self) -> String {
        let ident = quote_ident(&self.source_name);
        match self.column_type {
            ColumnType::Varchar => format!("rtrim({})", ident),
            ColumnType::Numeric | ColumnType::Other(_) => format!("CAST({} AS text)", ident),
            _ => ident,
        }
    }

    /// Placeholder used when inserting the column into the target.
    pub fn placeholder(&self, index: usize) -> String {
        match &self.column_type {
            ColumnType::Other(name) => format!("CAST(CAST(${} AS text) AS {})", index, name),
            ColumnType::Numeric => format!("CAST(CAST(${} AS text) AS numeric)", index),
            _ => format!("${}", index),
        }
    }

    /// Expression compared during change detection, qualified by `alias`.
    ///
    /// `json` and some other types have no equality operator, so they are compared as text.
    pub fn comparable(&self, alias: &str) -> String {
        let qualified = format!("{}.{}", alias, quote_ident(&self.target_name));
        match self.column_type {
            ColumnType::Json | ColumnType::Other(_) => format!("CAST({} AS text)", qualified),
            _ => qualified,
        }
    }
}

/// Raw `information_schema.columns` entry.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
    pub max_length: Option<i32>,
}

/// Everything the pipeline needs to know about one table.
///
/// Passed explicitly into every step; column order is the sorted source
/// column order and is shared by every generated SELECT/INSERT pair.
#[derive(Debug, Clone)]
pub struct TableContext {
    pub schemas: Schemas,
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: ColumnSpec,
}

impl TableContext {
    /// Build the context from raw column metadata.
    pub fn build(spec: &TableSpec, schemas: &Schemas, raw: Vec<RawColumn>) -> Result<Self> {
        validate_postgres_identifier(&schemas.source)?;
        validate_postgres_identifier(&schemas.target)?;
        validate_postgres_identifier(&spec.name)?;
        // stg_del_ is the longest generated prefix
        validate_postgres_identifier(&format!("stg_del_{}", spec.name))?;

        if raw.is_empty() {
            return Err(LoadError::SchemaNotFound {
                schema: schemas.source.clone(),
                table: spec.name.clone(),
            });
        }

        for required in [CREATED_COLUMN, UPDATED_COLUMN, spec.primary_key.as_str()] {
            if !raw.iter().any(|c| c.name == required) {
                return Err(LoadError::MissingColumn {
                    table: spec.name.clone(),
                    column: required.to_string(),
                });
            }
        }

        for source in spec.rename.keys() {
            if !raw.iter().any(|c| &c.name == source) {
                tracing::warn!(
                    "Rename for {}.{} ignored: no such column",
                    spec.name,
                    source
                );
            }
        }

        let mut columns = raw
            .into_iter()
            .filter(|c| c.name != CREATED_COLUMN && c.name != UPDATED_COLUMN)
            .map(|c| -> Result<ColumnSpec> {
                validate_postgres_identifier(&c.name)?;
                let target_name = spec
                    .rename
                    .get(&c.name)
                    .cloned()
                    .unwrap_or_else(|| c.name.clone());
                validate_postgres_identifier(&target_name)?;
                let column_type = ColumnType::from_information_schema(&c.data_type, &c.udt_name)?;
                let length = if column_type.is_character() {
                    c.max_length
                } else {
                    None
                };
                Ok(ColumnSpec {
                    source_name: c.name,
                    target_name,
                    column_type,
                    length,
                })
            })
            .collect::<Result<Vec<ColumnSpec>>>()?;

        columns.sort_by(|a, b| a.source_name.cmp(&b.source_name));

        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if RESERVED_TARGET_COLUMNS.contains(&column.target_name.as_str()) {
                return Err(LoadError::InvalidIdentifier(format!(
                    "column '{}' of {} collides with reserved history column",
                    column.target_name, spec.name
                )));
            }
            if !seen.insert(column.target_name.as_str()) {
                return Err(LoadError::InvalidIdentifier(format!(
                    "duplicate target column '{}' in {}",
                    column.target_name, spec.name
                )));
            }
        }

        let primary_key = columns
            .iter()
            .find(|c| c.source_name == spec.primary_key)
            .cloned()
            .ok_or_else(|| LoadError::MissingColumn {
                table: spec.name.clone(),
                column: spec.primary_key.clone(),
            })?;

        Ok(Self {
            schemas: schemas.clone(),
            table: spec.name.clone(),
            columns,
            primary_key,
        })
    }

    pub fn source_relation(&self) -> String {
        quote_qualified(&self.schemas.source, &self.table)
    }

    pub fn staging_relation(&self) -> String {
        quote_qualified(&self.schemas.target, &format!("stg_{}", self.table))
    }

    pub fn history_relation(&self) -> String {
        quote_qualified(&self.schemas.target, &format!("hist_{}", self.table))
    }

    pub fn delete_marker_relation(&self) -> String {
        quote_qualified(&self.schemas.target, &format!("stg_del_{}", self.table))
    }

    pub fn meta_relation(&self) -> String {
        quote_qualified(&self.schemas.target, "meta_loads")
    }

    /// Quoted target column names in context order.
    pub fn target_column_list(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| quote_ident(&c.target_name))
            .collect()
    }

    /// Quoted target primary key column.
    pub fn target_key(&self) -> String {
        quote_ident(&self.primary_key.target_name)
    }
}

/// Read column metadata for `spec` from the source and build its context.
pub async fn introspect<C: GenericClient>(
    client: &C,
    spec: &TableSpec,
    schemas: &Schemas,
) -> Result<TableContext> {
    let rows = client
        .query(
            "SELECT CAST(column_name AS text),
                    CAST(data_type AS text),
                    CAST(udt_name AS text),
                    CAST(character_maximum_length AS integer)
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY column_name",
            &[&schemas.source, &spec.name],
        )
        .await
        .map_err(|e| LoadError::sql(format!("introspecting {}.{}", schemas.source, spec.name), e))?;

    let raw: Vec<RawColumn> = rows
        .iter()
        .map(|row| RawColumn {
            name: row.get(0),
            data_type: row.get(1),
            udt_name: row.get(2),
            max_length: row.get(3),
        })
        .collect();

    let context = TableContext::build(spec, schemas, raw)?;

    tracing::info!(
        "Introspected {}.{}: {} columns, primary key {}",
        schemas.source,
        spec.name,
        context.columns.len(),
        context.primary_key.target_name
    );

    Ok(context)
}
