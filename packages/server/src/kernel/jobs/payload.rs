//! Typed job payloads.
//!
//! Every background job is a serde struct implementing [`JobPayload`].
//! The struct names its queue and type, and opts into content-keyed
//! deduplication: two live jobs with the same canonical payload collapse
//! into one.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub trait JobPayload: Serialize {
    const QUEUE: &'static str;
    const JOB_TYPE: &'static str;

    /// Smaller is claimed first.
    fn priority(&self) -> i16 {
        0
    }

    fn max_attempts(&self) -> i32 {
        3
    }

    /// Whether enqueues of this payload collapse by content.
    fn dedup(&self) -> bool {
        false
    }
}

/// Canonical dedup key over `(queue, type, payload)`.
///
/// serde_json serialises a given struct's fields in declaration order, so
/// the digest is stable for payloads of the same type.
pub fn dedup_key<P: JobPayload>(payload: &P) -> Result<String> {
    let body = serde_json::to_string(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(P::QUEUE.as_bytes());
    hasher.update(b":");
    hasher.update(P::JOB_TYPE.as_bytes());
    hasher.update(b":");
    hasher.update(body.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct RefreshThing {
        thing_id: i64,
    }

    impl JobPayload for RefreshThing {
        const QUEUE: &'static str = "things";
        const JOB_TYPE: &'static str = "refresh_thing";

        fn dedup(&self) -> bool {
            true
        }
    }

    #[test]
    fn equal_payloads_share_a_key() {
        let a = dedup_key(&RefreshThing { thing_id: 7 }).unwrap();
        let b = dedup_key(&RefreshThing { thing_id: 7 }).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_payloads_get_distinct_keys() {
        let a = dedup_key(&RefreshThing { thing_id: 7 }).unwrap();
        let b = dedup_key(&RefreshThing { thing_id: 8 }).unwrap();
        assert_ne!(a, b);
    }
}
