//! Entity enrichment: fetchers, freshness cache, and rolling stats.

pub mod fetcher;
pub mod models;
pub mod stats;

pub use fetcher::{refresh_stale_entities, repair_unclassified_types};
