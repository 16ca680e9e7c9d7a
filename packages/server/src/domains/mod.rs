//! Domain modules.

pub mod backfill;
pub mod entities;
pub mod feeds;
pub mod killmails;
pub mod prices;

use crate::kernel::jobs::JobRegistry;

/// Build the registry with every domain's job handlers.
pub fn build_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    killmails::jobs::register_jobs(&mut registry);
    entities::fetcher::register_jobs(&mut registry);
    entities::stats::register_jobs(&mut registry);
    prices::fetcher::register_jobs(&mut registry);
    registry
}
