//! Cooperative cancellation for in-flight stage dispatches.
//!
//! A cancel signal never interrupts an activity attempt mid-flight. It sets
//! a flag that stage execution checks at attempt boundaries: before starting
//! an attempt, before scheduling a retry and before resolving the dispatch.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flag shared between the signal surface and a running stage dispatch.
pub struct CancelFlag {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl std::fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelFlag")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .field("reason", &self.reason.lock())
            .finish()
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }
}

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The reason cancellation was requested, if it was.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Requests cancellation. Idempotent; the first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            *self.reason.lock() = Some(reason.into());
        }
    }

    /// The reason, or a fixed fallback for flag-set-without-reason paths.
    #[must_use]
    pub fn reason_or_default(&self) -> String {
        self.reason()
            .unwrap_or_else(|| "cancel requested".to_string())
    }
}
