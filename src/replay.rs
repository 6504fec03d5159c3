//! Replay protection: a bounded LRU nonce cache plus a timestamp freshness
//! window. Together they make replaying a captured envelope infeasible
//! without ever persisting state across a daemon restart.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use lru::LruCache;

use crate::error::{Error, Result};

/// Minimum nonce cache capacity, per §4.2.
pub const MIN_CAPACITY: usize = 10_000;

/// The symmetric freshness window, in seconds, per §4.2.
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Current wall-clock time, in seconds since the epoch.
#[must_use]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs() as i64
}

/// Rejects stale and replayed envelopes.
///
/// Access is serialized by an internal mutex; the guard is only ever
/// touched from the daemon's request-handling path (§4.2 concurrency).
pub struct ReplayGuard {
    seen: Mutex<LruCache<Vec<u8>, ()>>,
    window_secs: i64,
}

impl ReplayGuard {
    /// Create a guard with the given nonce cache capacity and freshness
    /// window.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, window_secs: i64) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("replay cache capacity must be nonzero");
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            window_secs,
        }
    }

    /// Check an envelope's `(nonce, timestamp)` against the freshness
    /// window and the nonce cache, inserting the nonce on success.
    ///
    /// # Errors
    ///
    /// Returns `Error::StaleEnvelope` if `timestamp` lies outside the
    /// window around `now`, or `Error::ReplayedEnvelope` if the nonce has
    /// already been accepted.
    pub fn check(&self, nonce_b64: &str, timestamp: i64) -> Result<()> {
        self.check_at(nonce_b64, timestamp, now_secs())
    }

    /// As [`ReplayGuard::check`], but with an explicit `now` for testing
    /// boundary behavior deterministically.
    pub fn check_at(&self, nonce_b64: &str, timestamp: i64, now: i64) -> Result<()> {
        if (now - timestamp).abs() > self.window_secs {
            return Err(Error::StaleEnvelope {
                timestamp,
                now,
                window_secs: self.window_secs,
            });
        }

        let nonce = base64::engine::general_purpose::STANDARD
            .decode(nonce_b64)
            .map_err(|e| Error::MalformedMessage(format!("invalid base64 nonce: {e}")))?;

        let mut seen = self.seen.lock().expect("replay cache mutex poisoned");
        if seen.contains(&nonce) {
            return Err(Error::ReplayedEnvelope);
        }
        seen.put(nonce, ());
        Ok(())
    }
}
