//! Retry policy with exponential backoff for reconcile errors
//!
//! Errors are classified as transient or permanent. Transient errors requeue
//! with a growing delay; permanent ones wait for the object to change.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{debug, warn};

use crate::error::ReconcileError;

/// Maximum number of retries before giving up
const MAX_RETRIES: u32 = 10;

/// Base delay for exponential backoff (seconds)
const BASE_DELAY_SECS: u64 = 5;

/// Maximum delay between retries (1 hour)
const MAX_DELAY_SECS: u64 = 3600;

/// Tracks retry attempts per object key.
///
/// Uses a std mutex so the synchronous controller error policy can call it.
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        // Counters stay usable even if a holder panicked
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Increment retry count for a key and return the new count
    pub fn increment(&self, key: &str) -> u32 {
        let mut attempts = self.lock();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset retry count (call on successful reconciliation)
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn get(&self, key: &str) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    /// Drop entries for keys that no longer exist
    pub fn cleanup(&self, active_keys: &[String]) {
        self.lock().retain(|key, _| active_keys.contains(key));
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store unavailable or lost an optimistic-concurrency race
    Transient,
    /// Malformed input; nothing changes until the object does
    Permanent,
}

pub fn classify_error(error: &ReconcileError) -> ErrorKind {
    match error {
        ReconcileError::BackendUnavailable(_) | ReconcileError::Conflict(_) => ErrorKind::Transient,
        ReconcileError::InvalidSpec(_) | ReconcileError::SerializationFailed(_) => {
            ErrorKind::Permanent
        }
    }
}

/// Backoff delay for a transient failure, or `None` once retries are
/// exhausted.
pub fn backoff_delay(attempt: u32) -> Option<Duration> {
    if attempt >= MAX_RETRIES {
        return None;
    }
    // 5s, 10s, 20s, 40s, ... up to 1 hour
    let delay_secs = BASE_DELAY_SECS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Some(Duration::from_secs(delay_secs.min(MAX_DELAY_SECS)))
}

/// Determine the controller action for a failed attempt
pub fn compute_backoff(attempt: u32, kind: ErrorKind) -> Action {
    match kind {
        ErrorKind::Transient => match backoff_delay(attempt) {
            Some(delay) => {
                debug!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Scheduling retry with exponential backoff"
                );
                Action::requeue(delay)
            }
            None => {
                warn!(
                    attempt,
                    max_retries = MAX_RETRIES,
                    "Max retries exceeded, waiting for resource change"
                );
                Action::await_change()
            }
        },
        ErrorKind::Permanent => {
            warn!("Permanent error, waiting for resource change");
            Action::await_change()
        }
    }
}
