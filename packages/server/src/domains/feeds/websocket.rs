//! Realtime stream listener.
//!
//! Maintains one WebSocket connection to the killstream feed:
//!
//! ```text
//! Disconnected → Connecting → Subscribed → Receiving ⇄ Ping/Pong
//!       ▲                                      │
//!       └──── reconnect w/ backoff (base 5s) ──┘
//! ```
//!
//! Each inbound frame is filtered against the followed-entity sets,
//! checked against the database for duplicates, and enqueued as a fetch
//! job. The listener never ingests inline; the killmails queue owns that.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FollowedIds;
use crate::domains::killmails::jobs::FetchKillmail;
use crate::domains::killmails::models::Killmail;
use crate::kernel::ServerDeps;

/// Base reconnect delay; doubles per consecutive failure.
const RECONNECT_BASE: Duration = Duration::from_secs(5);

/// Reconnect delays cap here.
const RECONNECT_MAX: Duration = Duration::from_secs(300);

const SUBSCRIBE_MESSAGE: &str = r#"{"action":"sub","channel":"killstream"}"#;

#[derive(Debug, Clone)]
pub struct StreamListenerConfig {
    pub url: String,
    pub followed: FollowedIds,
    /// Consecutive failed sessions before giving up.
    pub max_reconnect_attempts: u32,
}

impl StreamListenerConfig {
    pub fn new(url: impl Into<String>, followed: FollowedIds) -> Self {
        Self {
            url: url.into(),
            followed,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ListenerCounters {
    pub received: u64,
    pub filtered: u64,
    pub duplicates: u64,
    pub enqueued: u64,
}

pub struct StreamListener {
    config: StreamListenerConfig,
    deps: Arc<ServerDeps>,
}

impl StreamListener {
    pub fn new(config: StreamListenerConfig, deps: Arc<ServerDeps>) -> Self {
        Self { config, deps }
    }

    /// Run until shutdown or until reconnect attempts are exhausted.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut counters = ListenerCounters::default();
        let mut attempts = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_session(&shutdown, &mut counters, &mut attempts).await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }

                    attempts += 1;
                    if attempts > self.config.max_reconnect_attempts {
                        self.report(&counters);
                        return Err(e.context("stream reconnect attempts exhausted"));
                    }

                    let exponent = attempts.saturating_sub(1).min(6);
                    let delay = (RECONNECT_BASE * 2u32.pow(exponent)).min(RECONNECT_MAX);
                    warn!(
                        attempt = attempts,
                        max = self.config.max_reconnect_attempts,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "stream disconnected, reconnecting"
                    );

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.report(&counters);
        Ok(())
    }

    /// One connect → subscribe → receive session. Returns `Ok(())` only
    /// on a clean shutdown request.
    async fn run_session(
        &self,
        shutdown: &CancellationToken,
        counters: &mut ListenerCounters,
        attempts: &mut u32,
    ) -> Result<()> {
        let (mut ws, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = connect_async(self.config.url.as_str()) => {
                connected.with_context(|| format!("failed to connect to {}", self.config.url))?
            }
        };

        ws.send(Message::Text(SUBSCRIBE_MESSAGE.into()))
            .await
            .context("failed to subscribe to killstream")?;
        info!(url = %self.config.url, "stream subscribed");
        *attempts = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                }
                message = ws.next() => {
                    match message {
                        None => anyhow::bail!("stream ended"),
                        Some(Err(e)) => return Err(e).context("stream read failed"),
                        Some(Ok(Message::Ping(payload))) => {
                            ws.send(Message::Pong(payload)).await.context("pong failed")?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            anyhow::bail!("stream closed by upstream: {frame:?}");
                        }
                        Some(Ok(Message::Text(text))) => {
                            counters.received += 1;
                            if let Err(e) = self.handle_frame(&text, counters).await {
                                warn!(error = %e, "failed to handle stream frame");
                            }
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str, counters: &mut ListenerCounters) -> Result<()> {
        let frame: esi::StreamFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "skipping undecodable frame");
                return Ok(());
            }
        };

        let (Some(killmail_id), Some(zkb)) = (frame.killmail_id, frame.zkb) else {
            // Heartbeats and acks carry no killmail.
            return Ok(());
        };

        if let Some(killmail) = &frame.killmail {
            if !self.config.followed.matches(killmail) {
                counters.filtered += 1;
                return Ok(());
            }
        }

        if Killmail::exists_upstream(killmail_id, &self.deps.db).await? {
            counters.duplicates += 1;
            return Ok(());
        }

        let created = self
            .deps
            .jobs
            .dispatch(&FetchKillmail {
                killmail_id,
                hash: zkb.hash,
            })
            .await?;
        if created.is_some() {
            counters.enqueued += 1;
        }

        Ok(())
    }

    fn report(&self, counters: &ListenerCounters) {
        info!(
            received = counters.received,
            filtered = counters.filtered,
            duplicates = counters.duplicates,
            enqueued = counters.enqueued,
            "stream listener stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_curve_caps() {
        // Mirrors the delay arithmetic in run().
        let delay = |attempts: u32| {
            let exponent = attempts.saturating_sub(1).min(6);
            (RECONNECT_BASE * 2u32.pow(exponent)).min(RECONNECT_MAX)
        };
        assert_eq!(delay(1), Duration::from_secs(5));
        assert_eq!(delay(2), Duration::from_secs(10));
        assert_eq!(delay(4), Duration::from_secs(40));
        assert_eq!(delay(10), RECONNECT_MAX);
    }
}
