// ABOUTME: CLI entry point for scd2-historizer
// ABOUTME: Parses commands and routes them to the historization engine

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use scd2_historizer::config::Config;
use scd2_historizer::postgres::{connect_with_retry, init_tls_policy, target_now};
use scd2_historizer::scd2::{Historizer, LoadStats, ParsedTimestamp};
use scd2_historizer::script::PositionalScript;
use scd2_historizer::utils::validate_connection_string;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scd2-historizer")]
#[command(about = "Incremental SCD2 historization of PostgreSQL tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Historize configured tables into their history tables
    Run {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: PathBuf,
        /// Source connection string (overrides source_url)
        #[arg(long, env = "SCD2_SOURCE_URL")]
        source: Option<String>,
        /// Target connection string (overrides target_url)
        #[arg(long, env = "SCD2_TARGET_URL")]
        target: Option<String>,
        /// Only historize these tables (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,
        /// Timestamp recorded on tombstones, "YYYY-MM-DD HH:MM:SS" (defaults to the target's now())
        #[arg(long = "apply-time")]
        apply_time: Option<String>,
    },
    /// Run a bootstrap SQL script on the target, filling every %s with --param
    Bootstrap {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, env = "SCD2_TARGET_URL")]
        target: Option<String>,
        /// Path to the SQL script
        #[arg(long)]
        script: PathBuf,
        /// Value replicated into each %s placeholder
        #[arg(long)]
        param: Option<String>,
    },
    /// Load and validate a configuration file without connecting
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, env = "SCD2_SOURCE_URL")]
        source: Option<String>,
        #[arg(long, env = "SCD2_TARGET_URL")]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log, which defaults to "info"
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    init_tls_policy(cli.allow_self_signed_certs);

    match cli.command {
        Commands::Run {
            config,
            source,
            target,
            tables,
            apply_time,
        } => run(config, source, target, tables, apply_time).await,
        Commands::Bootstrap {
            config,
            target,
            script,
            param,
        } => bootstrap(config, target, script, param).await,
        Commands::CheckConfig {
            config,
            source,
            target,
        } => check_config(config, source, target),
    }
}

async fn run(
    config_path: PathBuf,
    source: Option<String>,
    target: Option<String>,
    tables: Vec<String>,
    apply_time: Option<String>,
) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?.with_overrides(source, target);
    let (source_url, target_url) = config.connection_urls()?;
    let selected = config.select_tables(&tables)?;

    let requested = match apply_time.as_deref().map(ParsedTimestamp::parse) {
        None => None,
        Some(ParsedTimestamp::Valid(ts)) => Some(ts),
        Some(ParsedTimestamp::InvalidFormat(raw)) => bail!(
            "Invalid --apply-time '{}': expected YYYY-MM-DD HH:MM:SS",
            raw
        ),
    };

    let source_client = connect_with_retry(source_url, "source", config.connect_retries).await?;
    let target_client = connect_with_retry(target_url, "target", config.connect_retries).await?;

    let applied_at = match requested {
        Some(ts) => ts,
        None => target_now(&target_client).await?,
    };
    tracing::info!(
        "Historizing {} table(s) with apply time {}",
        selected.len(),
        applied_at
    );

    let mut historizer = Historizer::new(source_client, target_client, config.schemas());
    let results = historizer
        .run(&selected, applied_at)
        .await
        .context("Historization stopped")?;

    print_summary(&results);
    Ok(())
}

fn print_summary(results: &[LoadStats]) {
    println!("Historized {} table(s):", results.len());
    for stats in results {
        println!(
            "  {}: {} staged, {} inserted, {} tombstoned, {} closed (watermark {} -> {})",
            stats.table,
            stats.staged_rows,
            stats.delta.inserted,
            stats.delta.tombstoned,
            stats.delta.closed,
            stats.watermark_before,
            stats.watermark_after
        );
    }
}

async fn bootstrap(
    config_path: PathBuf,
    target: Option<String>,
    script_path: PathBuf,
    param: Option<String>,
) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?.with_overrides(None, target);
    let target_url = config
        .target_url
        .as_deref()
        .context("Target URL not set; use target_url, --target or SCD2_TARGET_URL")?;
    validate_connection_string(target_url).context("Invalid target URL")?;

    let script = PositionalScript::from_file(&script_path)?;
    let client = connect_with_retry(target_url, "target", config.connect_retries).await?;
    script.execute(&client, param.as_deref()).await?;

    println!(
        "Bootstrap script {} applied ({} placeholder(s))",
        script_path.display(),
        script.placeholder_count()
    );
    Ok(())
}

fn check_config(
    config_path: PathBuf,
    source: Option<String>,
    target: Option<String>,
) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?.with_overrides(source, target);

    if config.source_url.is_some() || config.target_url.is_some() {
        config.connection_urls()?;
    }

    println!(
        "Configuration OK: {} table(s), {} -> {}",
        config.tables.len(),
        config.source_schema,
        config.target_schema
    );
    for table in &config.tables {
        println!("  {} (key: {})", table.name, table.primary_key);
    }
    Ok(())
}
