//! Long-poll feed consumer.
//!
//! The poll endpoint delivers full killmail bodies, so this consumer
//! skips the fetch hop and hands packages straight to the ingestor. An
//! empty `package` means nothing was waiting: wait two seconds and
//! re-poll.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domains::killmails::{ingest_killmail, IngestOutcome};
use crate::kernel::ServerDeps;

const EMPTY_POLL_WAIT: Duration = Duration::from_secs(2);
const ERROR_WAIT: Duration = Duration::from_secs(5);

pub struct PollConsumer {
    client: esi::RedisqClient,
    deps: Arc<ServerDeps>,
}

impl PollConsumer {
    pub fn new(client: esi::RedisqClient, deps: Arc<ServerDeps>) -> Self {
        Self { client, deps }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut received = 0u64;
        let mut inserted = 0u64;
        let mut duplicates = 0u64;
        let mut errors = 0u64;

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.client.poll() => polled,
            };

            match polled {
                Ok(Some(package)) => {
                    received += 1;
                    match ingest_killmail(&self.deps, &package.killmail, &package.zkb.hash).await {
                        Ok(IngestOutcome::Inserted { .. }) => inserted += 1,
                        Ok(IngestOutcome::Duplicate) => duplicates += 1,
                        Err(e) => {
                            errors += 1;
                            warn!(kill_id = package.kill_id, error = %e, "poll ingest failed");
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(EMPTY_POLL_WAIT) => {}
                    }
                }
                Err(e) => {
                    errors += 1;
                    warn!(error = %e, "poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_WAIT) => {}
                    }
                }
            }
        }

        info!(received, inserted, duplicates, errors, "poll consumer stopped");
        Ok(())
    }
}
