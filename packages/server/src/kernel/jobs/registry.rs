//! Job registry: `(queue, type)` to handler.
//!
//! Each domain registers its payload types at startup. Workers claim rows
//! and hand them here; the registry deserialises the payload and runs the
//! matching handler. Unknown types and undecodable payloads are permanent
//! failures so they cannot poison a retry budget.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::job::Job;
use super::payload::JobPayload;
use crate::kernel::ServerDeps;

type BoxedHandler = Box<
    dyn Fn(serde_json::Value, Arc<ServerDeps>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("unknown job type {queue}/{job_type}")]
    UnknownJobType { queue: String, job_type: String },

    #[error("undecodable payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Handler(anyhow::Error),
}

impl ExecuteError {
    /// Unknown types and bad payloads never retry; handler errors are
    /// classified by the worker.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ExecuteError::UnknownJobType { .. } | ExecuteError::Payload(_))
    }
}

#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<(String, String), BoxedHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type with its handler.
    pub fn register<P, F, Fut>(&mut self, handler: F)
    where
        P: JobPayload + DeserializeOwned + Send + Sync + 'static,
        F: Fn(P, Arc<ServerDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |value, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value)?;
                handler(payload, deps).await
            })
        });

        self.handlers
            .insert((P::QUEUE.to_string(), P::JOB_TYPE.to_string()), boxed);
    }

    /// Deserialise and run a claimed job.
    pub async fn execute(
        &self,
        job: &Job,
        deps: Arc<ServerDeps>,
    ) -> std::result::Result<(), ExecuteError> {
        let handler = self
            .handlers
            .get(&(job.queue.clone(), job.job_type.clone()))
            .ok_or_else(|| ExecuteError::UnknownJobType {
                queue: job.queue.clone(),
                job_type: job.job_type.clone(),
            })?;

        match handler(job.payload.clone(), deps).await {
            Ok(()) => Ok(()),
            Err(e) if e.is::<serde_json::Error>() => Err(ExecuteError::Payload(e.to_string())),
            Err(e) => Err(ExecuteError::Handler(e)),
        }
    }

    pub fn is_registered(&self, queue: &str, job_type: &str) -> bool {
        self.handlers
            .contains_key(&(queue.to_string(), job_type.to_string()))
    }

    /// Queues that have at least one registered handler.
    pub fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = self
            .handlers
            .keys()
            .map(|(queue, _)| queue.as_str())
            .collect();
        queues.sort_unstable();
        queues.dedup();
        queues
    }
}

pub type SharedJobRegistry = Arc<JobRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct NoopJob {
        value: i64,
    }

    impl JobPayload for NoopJob {
        const QUEUE: &'static str = "noop";
        const JOB_TYPE: &'static str = "noop_job";
    }

    #[test]
    fn register_and_check() {
        let mut registry = JobRegistry::new();
        registry.register::<NoopJob, _, _>(|_job, _deps| async move { Ok(()) });

        assert!(registry.is_registered("noop", "noop_job"));
        assert!(!registry.is_registered("noop", "other"));
        assert_eq!(registry.queues(), vec!["noop"]);
    }

    #[test]
    fn unknown_and_payload_errors_are_permanent() {
        let unknown = ExecuteError::UnknownJobType {
            queue: "q".into(),
            job_type: "t".into(),
        };
        assert!(unknown.is_permanent());
        assert!(ExecuteError::Payload("bad".into()).is_permanent());
        assert!(!ExecuteError::Handler(anyhow::anyhow!("boom")).is_permanent());
    }
}
