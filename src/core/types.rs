//! Common types used across coordinator modules.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Timestamp wrapper for consistent serialization.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Get current UTC timestamp.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}

/// Duration elapsed since `ts`, clamped at zero for clock skew.
pub fn age(ts: Timestamp) -> std::time::Duration {
    (now() - ts).to_std().unwrap_or_default()
}

/// Explicit per-request context.
///
/// Carries the caller's location instead of reading it from process-wide state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Region the caller runs in, if known
    pub origin_region: Option<String>,
}

impl RequestContext {
    /// Context for a caller colocated with `region_id`.
    pub fn from_region(region_id: &str) -> Self {
        Self {
            origin_region: Some(region_id.to_string()),
        }
    }

    /// Context for a caller whose location is unknown.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Whether the caller runs in `region_id`.
    pub fn is_in(&self, region_id: &str) -> bool {
        self.origin_region.as_deref() == Some(region_id)
    }
}

/// A write to be applied at a region: logical key plus opaque content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePayload {
    /// Logical key the write targets
    pub key: String,
    /// Opaque write content
    pub data: Vec<u8>,
    /// SHA3-256 digest of `data`, hex encoded
    pub digest: String,
    /// Submission sequence, increasing in submission order
    pub sequence: u64,
}

impl WritePayload {
    /// Create a payload with sequence 0.
    pub fn new(key: &str, data: Vec<u8>) -> Self {
        let digest = payload_digest(&data);
        Self {
            key: key.to_string(),
            data,
            digest,
            sequence: 0,
        }
    }

    /// Set the submission sequence.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Check the content against its digest.
    pub fn verify(&self) -> bool {
        payload_digest(&self.data) == self.digest
    }
}

/// Hex-encoded SHA3-256 of a payload body.
pub fn payload_digest(data: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Monotonic sequence source.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU64);

impl Sequence {
    /// Create a sequence starting after `start`.
    pub fn starting_at(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    /// Next value (first call returns start + 1).
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last value handed out.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_context() {
        let ctx = RequestContext::from_region("eu-west");
        assert!(ctx.is_in("eu-west"));
        assert!(!ctx.is_in("us-east"));
        assert!(!RequestContext::anonymous().is_in("eu-west"));
    }

    #[test]
    fn test_payload_digest() {
        let payload = WritePayload::new("user:1", b"hello".to_vec());
        assert_eq!(payload.digest.len(), 64);
        assert!(payload.verify());

        let mut tampered = payload.clone();
        tampered.data = b"hellp".to_vec();
        assert!(!tampered.verify());
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let seq = Sequence::default();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.current(), 2);
        assert_eq!(Sequence::starting_at(10).next(), 11);
    }

    #[test]
    fn test_age_is_non_negative() {
        assert!(age(now()) < std::time::Duration::from_secs(1));
    }
}
