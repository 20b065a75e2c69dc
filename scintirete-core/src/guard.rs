//! Per-operation deadline and cancellation guard.
//!
//! Long-running operations check the guard at their suspension points:
//! before lock acquisition, between batch items, between graph layer
//! descents. A check is two atomic loads.

use crate::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct OpGuard {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl OpGuard {
    /// Guard that never fires. Used by replay and internal maintenance.
    pub fn unbounded() -> Self {
        Self {
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Guard that fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation. Clones share the flag, so a handle kept
    /// by the caller cancels the operation that carried the clone.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Err(Cancelled)` if the caller cancelled or the deadline
    /// expired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled("cancelled by caller".into()));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::Cancelled("deadline exceeded".into()));
        }
        Ok(())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for OpGuard {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_never_fires() {
        let guard = OpGuard::unbounded();
        assert!(guard.check().is_ok());
        assert!(guard.remaining().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let guard = OpGuard::unbounded();
        let clone = guard.clone();
        guard.cancel();
        assert!(matches!(clone.check(), Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_expired_deadline_fires() {
        let guard = OpGuard::with_timeout(Duration::ZERO);
        assert!(matches!(guard.check(), Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_future_deadline_does_not_fire() {
        let guard = OpGuard::with_timeout(Duration::from_secs(60));
        assert!(guard.check().is_ok());
        assert!(guard.remaining().unwrap() > Duration::from_secs(50));
    }
}
