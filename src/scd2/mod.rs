// ABOUTME: SCD2 historization engine for update-in-place source tables
// ABOUTME: Introspection, provisioning, extraction, staging, delta application and watermarks

pub mod ddl;
pub mod delta;
pub mod extractor;
pub mod history;
pub mod loader;
pub mod schema;
pub mod staging;
pub mod watermark;

pub use delta::{DeltaApplier, DeltaStats};
pub use extractor::{ChangeExtractor, Extract};
pub use history::{open_end, open_row_violations, snapshot_at};
pub use loader::{provision_and_load, Historizer, LoadStats, ParsedTimestamp};
pub use schema::{introspect, ColumnSpec, ColumnType, Schemas, TableContext, TableSpec};
pub use staging::{StagedCounts, StagingLoader};
pub use watermark::{Watermark, WatermarkStore};
