//! `tallyforge-observability` - logging/tracing bootstrap.

pub mod tracing;

pub use tracing::init;
