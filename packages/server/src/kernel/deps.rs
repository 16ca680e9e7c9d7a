//! Shared dependency bundle handed to every job handler.

use std::sync::Arc;

use sqlx::PgPool;

use super::jobs::JobQueue;
use super::publisher::KillmailPublisher;

pub struct ServerDeps {
    pub db: PgPool,
    pub esi: Arc<esi::EsiClient>,
    pub jobs: Arc<JobQueue>,
    pub publisher: Arc<dyn KillmailPublisher>,
}

impl ServerDeps {
    pub fn new(
        db: PgPool,
        esi: Arc<esi::EsiClient>,
        jobs: Arc<JobQueue>,
        publisher: Arc<dyn KillmailPublisher>,
    ) -> Self {
        Self {
            db,
            esi,
            jobs,
            publisher,
        }
    }
}
