//! Monotonic time, identifiers, and canonical fingerprints.

use sha2::{Digest, Sha256};
use std::time::Instant;
use uuid::Uuid;

/// Monotonic clock anchored at construction
///
/// Readings are milliseconds since the anchor and never go backward,
/// unlike wall-clock timestamps. One clock instance is shared per
/// process; subsystems take readings for ordering and latency math.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn now_millis(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.anchor.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Canonical fingerprint over a sequence of byte parts
///
/// Each part is length-delimited before hashing so `["ab","c"]` and
/// `["a","bc"]` produce different digests. Equal inputs always produce
/// equal fingerprints across runs and platforms.
pub fn fingerprint(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
