//! Killmail ingestion, value calculation, and republish.

pub mod ingest;
pub mod jobs;
pub mod models;
pub mod publish;
pub mod values;

pub use ingest::{ingest_killmail, IngestOutcome};
