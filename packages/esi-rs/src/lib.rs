//! Rate-limited client for the EVE upstream APIs.
//!
//! All outgoing HTTP goes through [`EsiClient::fetch`]: it blocks on the
//! process-wide error-budget limiter, serves fresh responses from the
//! response cache, revalidates stale ones with `If-None-Match`, and maps
//! upstream statuses onto the [`EsiError`] taxonomy. The poll endpoint and
//! the historical export API get their own small clients since neither is
//! subject to the error budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, ETAG, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::warn;

pub mod cache;
pub mod error;
pub mod limiter;
pub mod models;

pub use cache::{CacheEntry, MemoryCache, ResponseCache};
pub use error::{EsiError, Result};
pub use limiter::ErrorLimiter;
pub use models::*;

/// Sent on every outbound request so the upstream can reach us.
pub const USER_AGENT: &str = "killfeed/0.1 (https://github.com/killfeed/killfeed)";

/// Error-budget response headers.
const BUDGET_REMAINING: &str = "error-budget-remaining";
const BUDGET_RESET: &str = "error-budget-reset";

/// Required on every outbound request.
const COMPATIBILITY_DATE: &str = "x-compatibility-date";

/// Timeout for calls to the primary upstream.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EsiClient {
    http: reqwest::Client,
    base_url: String,
    compatibility_date: String,
    limiter: ErrorLimiter,
    cache: Arc<dyn ResponseCache>,
}

impl EsiClient {
    pub fn new(
        base_url: impl Into<String>,
        compatibility_date: impl Into<String>,
        cache: Arc<dyn ResponseCache>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| EsiError::Fatal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            compatibility_date: compatibility_date.into(),
            limiter: ErrorLimiter::new(),
            cache,
        })
    }

    pub fn limiter(&self) -> &ErrorLimiter {
        &self.limiter
    }

    /// Fetch a path through the limiter and cache.
    ///
    /// The caller provides a stable cache key so distinct query shapes of
    /// the same path cache independently.
    pub async fn fetch(&self, path: &str, cache_key: &str) -> Result<serde_json::Value> {
        self.limiter.acquire().await;

        let cached = match self.cache.get(cache_key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(cache_key, error = %e, "response cache read failed");
                None
            }
        };

        if let Some(entry) = &cached {
            if entry.is_fresh(Utc::now()) {
                return Ok(entry.body.clone());
            }
        }

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .get(&url)
            .header(COMPATIBILITY_DATE, &self.compatibility_date);
        if let Some(etag) = cached.as_ref().and_then(|e| e.etag.as_deref()) {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        self.update_limiter(&headers).await;

        if status == StatusCode::NOT_MODIFIED {
            let Some(mut entry) = cached else {
                return Err(EsiError::Contract(
                    "not-modified response without a cached body".into(),
                ));
            };
            entry.expires_at = parse_expires(&headers).or(entry.expires_at);
            entry.last_modified = header_string(&headers, LAST_MODIFIED.as_str()).or(entry.last_modified);
            let body = entry.body.clone();
            self.store(cache_key, entry).await;
            return Ok(body);
        }

        if status == StatusCode::NOT_FOUND {
            return Err(EsiError::NotFound);
        }
        if status.is_server_error() {
            self.limiter.note_outage().await;
            return Err(EsiError::Transient(format!("upstream returned {status}")));
        }
        if !status.is_success() {
            return Err(EsiError::Fatal(format!("unexpected status {status} for {path}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EsiError::Contract(format!("undecodable body for {path}: {e}")))?;

        self.store(
            cache_key,
            CacheEntry {
                etag: header_string(&headers, ETAG.as_str()),
                expires_at: parse_expires(&headers),
                last_modified: header_string(&headers, LAST_MODIFIED.as_str()),
                body: body.clone(),
            },
        )
        .await;

        Ok(body)
    }

    /// `fetch` plus a typed decode. Shape mismatches are contract errors.
    pub async fn fetch_as<T: DeserializeOwned>(&self, path: &str, cache_key: &str) -> Result<T> {
        let body = self.fetch(path, cache_key).await?;
        serde_json::from_value(body)
            .map_err(|e| EsiError::Contract(format!("unexpected shape for {path}: {e}")))
    }

    pub async fn get_character(&self, id: i64) -> Result<Character> {
        self.fetch_as(&format!("/characters/{id}/"), &format!("characters:{id}"))
            .await
    }

    pub async fn get_corporation(&self, id: i64) -> Result<Corporation> {
        self.fetch_as(&format!("/corporations/{id}/"), &format!("corporations:{id}"))
            .await
    }

    pub async fn get_alliance(&self, id: i64) -> Result<Alliance> {
        self.fetch_as(&format!("/alliances/{id}/"), &format!("alliances:{id}"))
            .await
    }

    pub async fn get_type(&self, id: i64) -> Result<UniverseType> {
        self.fetch_as(&format!("/universe/types/{id}/"), &format!("types:{id}"))
            .await
    }

    pub async fn get_group(&self, id: i64) -> Result<UniverseGroup> {
        self.fetch_as(&format!("/universe/groups/{id}/"), &format!("groups:{id}"))
            .await
    }

    pub async fn get_killmail(&self, id: i64, hash: &str) -> Result<EsiKillmail> {
        self.fetch_as(
            &format!("/killmails/{id}/{hash}/"),
            &format!("killmails:{id}:{hash}"),
        )
        .await
    }

    /// Historical prices for a type over a day window, optionally anchored
    /// at a reference date.
    pub async fn get_market_history(
        &self,
        type_id: i64,
        days: u32,
        reference_date: Option<NaiveDate>,
    ) -> Result<Vec<MarketHistoryEntry>> {
        let (path, key) = match reference_date {
            Some(date) => (
                format!("/market/history/{type_id}/?days={days}&date={date}"),
                format!("market:{type_id}:{days}:{date}"),
            ),
            None => (
                format!("/market/history/{type_id}/?days={days}"),
                format!("market:{type_id}:{days}"),
            ),
        };
        self.fetch_as(&path, &key).await
    }

    async fn update_limiter(&self, headers: &HeaderMap) {
        let remaining = header_string(headers, BUDGET_REMAINING).and_then(|v| v.parse::<i32>().ok());
        let reset = header_string(headers, BUDGET_RESET).and_then(|v| v.parse::<u64>().ok());
        if let (Some(remaining), Some(reset)) = (remaining, reset) {
            self.limiter
                .update_from_headers(remaining, Duration::from_secs(reset))
                .await;
        }
    }

    async fn store(&self, cache_key: &str, entry: CacheEntry) {
        if let Err(e) = self.cache.put(cache_key, entry).await {
            warn!(cache_key, error = %e, "response cache write failed");
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn parse_expires(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = header_string(headers, "expires")?;
    DateTime::parse_from_rfc2822(&raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Poll endpoint
// ============================================================================

/// Client for the long-poll kill feed. Not subject to the error budget.
pub struct RedisqClient {
    http: reqwest::Client,
    url: String,
}

impl RedisqClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| EsiError::Fatal(format!("failed to build http client: {e}")))?;
        Ok(Self { http, url: url.into() })
    }

    /// One poll. `None` means no kill was waiting; the caller re-polls
    /// after a short pause.
    pub async fn poll(&self) -> Result<Option<RedisqPackage>> {
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(EsiError::Transient(format!("poll endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(EsiError::Fatal(format!("poll endpoint returned {status}")));
        }
        let decoded: RedisqResponse = response
            .json()
            .await
            .map_err(|e| EsiError::Contract(format!("undecodable poll response: {e}")))?;
        Ok(decoded.package)
    }
}

// ============================================================================
// Historical export API
// ============================================================================

/// Client for the paged historical export API.
pub struct ExportClient {
    http: reqwest::Client,
    base_url: String,
}

impl ExportClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| EsiError::Fatal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Fetch one `(skip, limit)` page of export rows.
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        filter: &serde_json::Value,
        limit: i64,
        skip: i64,
    ) -> Result<ExportPage<T>> {
        let body = serde_json::json!({
            "filter": filter,
            "options": { "limit": limit, "skip": skip },
        });

        let response = self
            .http
            .post(format!("{}/export", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EsiError::Transient(format!("export endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(EsiError::Fatal(format!("export endpoint returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| EsiError::Contract(format!("undecodable export page: {e}")))
    }

    /// Daily kill counts keyed `YYYYMMDD`.
    pub async fn totals(&self) -> Result<HashMap<String, i64>> {
        let response = self
            .http
            .get(format!("{}/totals", self.base_url))
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EsiError::Transient(format!("totals endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(EsiError::Fatal(format!("totals endpoint returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| EsiError::Contract(format!("undecodable totals response: {e}")))
    }
}
