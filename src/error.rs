// ABOUTME: Error taxonomy for the historization engine
// ABOUTME: Every per-table failure maps to one LoadError variant

use thiserror::Error;

/// Errors raised while historizing a single table.
#[derive(Error, Debug)]
pub enum LoadError {
    /// Introspection returned no columns for the source table
    #[error("Table {schema}.{table} not found or has no columns")]
    SchemaNotFound { schema: String, table: String },

    /// A column the engine depends on is missing from the source table
    #[error("Table {table} has no column '{column}'")]
    MissingColumn { table: String, column: String },

    /// An identifier cannot be safely interpolated into generated SQL
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Either database could not be reached
    #[error("Failed to connect to {endpoint} database")]
    Connection {
        endpoint: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generated SQL was rejected by the server
    #[error("SQL execution failed while {action}")]
    SqlExecution {
        action: String,
        #[source]
        source: tokio_postgres::Error,
    },

    /// An extracted row does not have the arity of the target table
    #[error("Row {row_index} of {table} has {actual} values, expected {expected}")]
    DataShapeMismatch {
        table: String,
        row_index: usize,
        expected: usize,
        actual: usize,
    },

    /// The per-table transaction was rolled back because of an earlier error
    #[error("Transaction for {table} rolled back")]
    TransactionAborted {
        table: String,
        #[source]
        source: Box<LoadError>,
    },
}

impl LoadError {
    /// Create a SqlExecution error describing what was being attempted
    pub fn sql(action: impl Into<String>, source: tokio_postgres::Error) -> Self {
        LoadError::SqlExecution {
            action: action.into(),
            source,
        }
    }

    /// Create a Connection error for the named endpoint ("source" or "target")
    pub fn connection(
        endpoint: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        LoadError::Connection {
            endpoint,
            source: source.into(),
        }
    }

    /// Wrap an error raised inside a table transaction
    pub fn aborted(table: impl Into<String>, source: LoadError) -> Self {
        LoadError::TransactionAborted {
            table: table.into(),
            source: Box::new(source),
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for historization operations.
pub type Result<T> = std::result::Result<T, LoadError>;
