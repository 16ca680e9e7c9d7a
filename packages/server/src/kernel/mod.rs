//! Core infrastructure: job system, upstream cache, publisher, scheduler,
//! and the dependency bundle handed to handlers.

pub mod deps;
pub mod esi_cache;
pub mod jobs;
pub mod publisher;
pub mod scheduled_tasks;

pub use deps::ServerDeps;
pub use esi_cache::PgResponseCache;
pub use publisher::{KillmailPublisher, NatsPublisher, NoopPublisher};
