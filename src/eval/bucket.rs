//! Deterministic percentage bucketing.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Number of buckets; bucket values fall in `[0, BUCKETS)`.
pub const BUCKETS: u64 = 100;

/// Per (feature, environment) salt so a caller's buckets are uncorrelated
/// across unrelated flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSalt(String);

impl BucketSalt {
    pub fn new(feature_key: &str, environment_id: Uuid) -> Self {
        Self(format!("{feature_key}:{environment_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Map `targeting_key` into `[0, 100)`.
pub fn bucket_of(targeting_key: &str, salt: &BucketSalt) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(salt.0.as_bytes());
    hasher.update(b":");
    hasher.update(targeting_key.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % BUCKETS) as u8
}
