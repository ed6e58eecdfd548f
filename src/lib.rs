// ABOUTME: Library root for scd2-historizer
// ABOUTME: Exports the historization engine, connections, configuration and script helpers

pub mod config;
pub mod error;
pub mod postgres;
pub mod scd2;
pub mod script;
pub mod utils;

pub use error::{LoadError, Result};
