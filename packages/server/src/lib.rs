//! Killfeed core library.
//!
//! Ingestion, enrichment, and persistence pipeline for EVE Online
//! killmails: realtime and historical feeds produce kill references, a
//! Postgres-backed job queue drives ingestion, and enrichment (entities,
//! prices, values, stats) runs as fan-out jobs after each killmail
//! commits. Enriched documents are republished over NATS.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::Config;
