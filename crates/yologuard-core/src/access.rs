//! Access log boundary.

use crate::types::AccessEvent;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogDeliveryError {
    #[error("access log unavailable: {0}")]
    Unavailable(String),
    #[error("access log rejected event {id}: {reason}")]
    Rejected { id: uuid::Uuid, reason: String },
}

/// Durable sink for access events.
///
/// `record` returns `Ok` only once the event is durable. Implementations that
/// also accept writes from other flows serialize those themselves.
pub trait AccessLogger: Send + Sync {
    fn record(&self, event: &AccessEvent) -> Result<(), LogDeliveryError>;
}

impl<L: AccessLogger + ?Sized> AccessLogger for std::sync::Arc<L> {
    fn record(&self, event: &AccessEvent) -> Result<(), LogDeliveryError> {
        (**self).record(event)
    }
}

/// Attempts and backoff for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Record `event`, retrying up to `policy.attempts` times in total.
///
/// Backoff doubles after each failure. Returns the last error when every
/// attempt failed.
pub fn deliver(
    logger: &dyn AccessLogger,
    event: &AccessEvent,
    policy: RetryPolicy,
) -> Result<(), LogDeliveryError> {
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.backoff;
    let mut attempt = 1;

    loop {
        match logger.record(event) {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::debug!(event = %event.id, attempt, error = %e, "access log write failed, retrying");
                if !backoff.is_zero() {
                    std::thread::sleep(backoff);
                }
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

/// Keeps events in memory. For tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<AccessEvent>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AccessEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AccessLogger for MemoryLogger {
    fn record(&self, event: &AccessEvent) -> Result<(), LogDeliveryError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
