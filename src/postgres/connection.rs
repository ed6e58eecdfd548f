// ABOUTME: PostgreSQL connection management for source and target databases
// ABOUTME: Handles TLS policy, retrying connection setup and the target clock

use std::sync::OnceLock;
use std::time::Duration;

use chrono::NaiveDateTime;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{Client, GenericClient};

use crate::error::{LoadError, Result};
use crate::utils::{retry_with_backoff, strip_password_from_url};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS policy.
///
/// Must be called before the first connection; later calls are ignored.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    let _ = ALLOW_SELF_SIGNED.set(allow_self_signed_certs);
}

fn allow_self_signed() -> bool {
    *ALLOW_SELF_SIGNED.get().unwrap_or(&false)
}

fn build_tls_connector() -> std::result::Result<MakeTlsConnector, native_tls::Error> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed())
        .danger_accept_invalid_hostnames(allow_self_signed())
        .build()?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open a connection and spawn its driver task.
///
/// `endpoint` names the role of the database ("source" or "target") in errors
/// and logs.
pub async fn connect(url: &str, endpoint: &'static str) -> Result<Client> {
    let tls = build_tls_connector().map_err(|e| LoadError::connection(endpoint, e))?;

    let (client, connection) = tokio_postgres::connect(url, tls).await.map_err(|e| {
        tracing::warn!("{} handshake with {} failed: {}", endpoint, strip_password_from_url(url), e);
        LoadError::connection(endpoint, e)
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("{} connection error: {}", endpoint, e);
        }
    });

    tracing::info!(
        "Connection to {} database {} is open",
        endpoint,
        strip_password_from_url(url)
    );

    Ok(client)
}

/// Connect with exponential backoff.
///
/// Retries only the connection handshake; `max_retries = 0` makes a single
/// attempt.
pub async fn connect_with_retry(
    url: &str,
    endpoint: &'static str,
    max_retries: u32,
) -> Result<Client> {
    retry_with_backoff(
        || connect(url, endpoint),
        max_retries,
        Duration::from_secs(1),
    )
    .await
}

/// Target clock, truncated (not rounded) to whole seconds.
pub const TARGET_NOW_QUERY: &str = "SELECT CAST(date_trunc('second', now()) AS timestamp(0))";

/// Read the apply-time clock from the target, truncated to whole seconds.
///
/// Taken once per run so every table's tombstones share one timestamp.
pub async fn target_now<C: GenericClient>(client: &C) -> Result<NaiveDateTime> {
    let row = client
        .query_one(TARGET_NOW_QUERY, &[])
        .await
        .map_err(|e| LoadError::sql("reading target clock", e))?;
    Ok(row.get(0))
}
