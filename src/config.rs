// ABOUTME: TOML configuration for historization runs
// ABOUTME: Connection strings, schema names and the ordered list of tables to historize

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::scd2::{Schemas, TableSpec};
use crate::utils::{
    validate_connection_string, validate_postgres_identifier, validate_source_target_different,
};

/// Environment variable overriding `source_url`
pub const ENV_SOURCE_URL: &str = "SCD2_SOURCE_URL";
/// Environment variable overriding `target_url`
pub const ENV_TARGET_URL: &str = "SCD2_TARGET_URL";

fn default_connect_retries() -> u32 {
    3
}

/// Contents of a historizer configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
    pub source_schema: String,
    pub target_schema: String,
    /// Retries when establishing a connection (never for a failed table)
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Tables in processing order
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Replace connection strings with command-line or environment values.
    pub fn with_overrides(mut self, source_url: Option<String>, target_url: Option<String>) -> Self {
        if source_url.is_some() {
            self.source_url = source_url;
        }
        if target_url.is_some() {
            self.target_url = target_url;
        }
        self
    }

    pub fn schemas(&self) -> Schemas {
        Schemas::new(&self.source_schema, &self.target_schema)
    }

    /// Check schema names and the table list.
    pub fn validate(&self) -> Result<()> {
        validate_postgres_identifier(&self.source_schema)
            .context("Invalid source_schema")?;
        validate_postgres_identifier(&self.target_schema)
            .context("Invalid target_schema")?;

        if self.tables.is_empty() {
            bail!("No tables configured; add at least one [[tables]] entry");
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            validate_postgres_identifier(&table.name)
                .with_context(|| format!("Invalid table name '{}'", table.name))?;
            validate_postgres_identifier(&table.primary_key)
                .with_context(|| format!("Invalid primary key for table '{}'", table.name))?;
            for (source, target) in &table.rename {
                validate_postgres_identifier(source)
                    .and_then(|_| validate_postgres_identifier(target))
                    .with_context(|| format!("Invalid rename in table '{}'", table.name))?;
            }
            if !seen.insert(table.name.as_str()) {
                bail!("Table '{}' is configured more than once", table.name);
            }
        }

        Ok(())
    }

    /// Both connection strings, validated and distinct.
    pub fn connection_urls(&self) -> Result<(&str, &str)> {
        let source = self.source_url.as_deref().with_context(|| {
            format!("Source URL not set; use source_url, --source or {}", ENV_SOURCE_URL)
        })?;
        let target = self.target_url.as_deref().with_context(|| {
            format!("Target URL not set; use target_url, --target or {}", ENV_TARGET_URL)
        })?;

        validate_connection_string(source).context("Invalid source URL")?;
        validate_connection_string(target).context("Invalid target URL")?;
        validate_source_target_different(source, target)?;

        Ok((source, target))
    }

    /// Configured tables, optionally narrowed to `names` (kept in configured order).
    pub fn select_tables(&self, names: &[String]) -> Result<Vec<TableSpec>> {
        if names.is_empty() {
            return Ok(self.tables.clone());
        }

        for name in names {
            if !self.tables.iter().any(|t| &t.name == name) {
                bail!("Table '{}' is not in the configuration", name);
            }
        }

        Ok(self
            .tables
            .iter()
            .filter(|t| names.contains(&t.name))
            .cloned()
            .collect())
    }
}
