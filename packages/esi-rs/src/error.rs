//! Error taxonomy for upstream calls.
//!
//! Callers branch on these variants: `NotFound` means the entity does not
//! exist and handlers fail soft; `Transient` feeds the caller's retry
//! policy; `Contract` marks an unexpected payload shape and must not be
//! retried; `Fatal` is everything else.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EsiError {
    /// Upstream returned 404. The entity or killmail does not exist.
    #[error("not found")]
    NotFound,

    /// Upstream 5xx, timeout, or connection failure. Safe to retry.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// The response decoded but did not match the expected shape.
    /// Retrying would poison the retry budget, so callers must not.
    #[error("unexpected upstream payload: {0}")]
    Contract(String),

    /// Any other failure (unexpected status, client build error).
    #[error("upstream request failed: {0}")]
    Fatal(String),
}

impl EsiError {
    /// Whether the caller's retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EsiError::Transient(_))
    }
}

impl From<reqwest::Error> for EsiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            EsiError::Transient(err.to_string())
        } else {
            EsiError::Fatal(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, EsiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(EsiError::Transient("503".into()).is_retryable());
    }

    #[test]
    fn contract_and_not_found_are_not_retryable() {
        assert!(!EsiError::Contract("bad shape".into()).is_retryable());
        assert!(!EsiError::NotFound.is_retryable());
        assert!(!EsiError::Fatal("boom".into()).is_retryable());
    }
}
