//! Duplicate signal suppression
//!
//! A short-lived seen-set keyed by (signal, resource id). A repeat of the same
//! key inside the window is rejected; the first occurrence always passes.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Entries older than this many windows are purged on the next check
const RETENTION_WINDOWS: u32 = 4;

/// Dedup errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DedupError {
    /// Same signal for the same resource seen inside the window
    #[error("Duplicate {signal} for {resource_id} ({age_ms} ms after previous)")]
    Duplicate {
        /// Signal token
        signal: String,
        /// Resource or peer id
        resource_id: String,
        /// Time since the accepted occurrence
        age_ms: u64,
    },
}

/// Time-window idempotency filter
pub struct DedupWindow {
    window: Duration,
    seen: RwLock<HashMap<(String, String), Instant>>,
}

impl DedupWindow {
    /// Create a filter with the given window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: RwLock::new(HashMap::new()),
        }
    }

    /// Accept the first occurrence of a key per window
    pub fn check(&self, signal: &str, resource_id: &str) -> Result<(), DedupError> {
        self.check_at(signal, resource_id, Instant::now())
    }

    fn check_at(&self, signal: &str, resource_id: &str, now: Instant) -> Result<(), DedupError> {
        let mut seen = self.seen.write().unwrap_or_else(PoisonError::into_inner);

        let key = (signal.to_string(), resource_id.to_string());
        if let Some(previous) = seen.get(&key) {
            let age = now.saturating_duration_since(*previous);
            if age < self.window {
                return Err(DedupError::Duplicate {
                    signal: key.0,
                    resource_id: key.1,
                    age_ms: age.as_millis() as u64,
                });
            }
        }
        seen.insert(key, now);

        let retention = self.window * RETENTION_WINDOWS;
        seen.retain(|_, at| now.saturating_duration_since(*at) < retention);
        Ok(())
    }

    /// Tracked keys (for monitoring)
    pub fn len(&self) -> usize {
        self.seen.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
