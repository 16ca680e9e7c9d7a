//! Downstream publish channel.
//!
//! Enriched killmail documents go out on the `killmails` subject. The
//! trait keeps the broker out of tests: handlers publish through
//! whatever implementation the deps carry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Pub/sub subject for enriched killmail documents.
pub const KILLMAILS_SUBJECT: &str = "killmails";

#[async_trait]
pub trait KillmailPublisher: Send + Sync {
    async fn publish(&self, document: &serde_json::Value) -> Result<()>;
}

pub struct NatsPublisher {
    client: async_nats::Client,
}

impl NatsPublisher {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("failed to connect to NATS at {url}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KillmailPublisher for NatsPublisher {
    async fn publish(&self, document: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_vec(document)?;
        self.client
            .publish(KILLMAILS_SUBJECT, payload.into())
            .await
            .context("failed to publish killmail document")?;
        Ok(())
    }
}

/// Drops documents on the floor; used in tests and broker-less deploys.
pub struct NoopPublisher;

#[async_trait]
impl KillmailPublisher for NoopPublisher {
    async fn publish(&self, document: &serde_json::Value) -> Result<()> {
        debug!(
            killmail_id = document.get("killmail_id").and_then(|v| v.as_i64()),
            "publish skipped (no broker configured)"
        );
        Ok(())
    }
}
