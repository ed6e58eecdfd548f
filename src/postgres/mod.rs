// ABOUTME: PostgreSQL connectivity shared by the source and target sides
// ABOUTME: Re-exports connection helpers

pub mod connection;

pub use connection::{connect, connect_with_retry, init_tls_policy, target_now};
