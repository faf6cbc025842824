//! In-flight HTTP-query tracker.
//!
//! Registers the message id of every HTTP-style query while a worker executes
//! it, so the inbound router can cancel long-running requests when the cloud
//! retracts them. Workers poll their flag at safe points and abort with a
//! timeout-style reply when it flips.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Shared cancellation flag handed to the executing worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Registry of `(msg_id, cancelled)` entries, keyed by message id.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    entries: Mutex<HashMap<String, CancelFlag>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns its cancellation flag.
    pub fn add(&self, msg_id: &str) -> CancelFlag {
        let flag = CancelFlag::default();
        self.entries
            .lock()
            .expect("in-flight tracker poisoned")
            .insert(msg_id.to_string(), flag.clone());
        flag
    }

    /// Marks a request cancelled. Returns whether the id was known.
    pub fn cancel(&self, msg_id: &str) -> bool {
        let entries = self.entries.lock().expect("in-flight tracker poisoned");
        match entries.get(msg_id) {
            Some(flag) => {
                flag.set();
                debug!("Marked in-flight request {msg_id} cancelled");
                true
            }
            None => false,
        }
    }

    /// Removes a completed request.
    pub fn remove(&self, msg_id: &str) {
        self.entries
            .lock()
            .expect("in-flight tracker poisoned")
            .remove(msg_id);
    }

    pub fn is_cancelled(&self, msg_id: &str) -> bool {
        self.entries
            .lock()
            .expect("in-flight tracker poisoned")
            .get(msg_id)
            .map(|flag| flag.is_cancelled())
            .unwrap_or(false)
    }

    /// Cancels everything; used at shutdown.
    pub fn cancel_all(&self) {
        let entries = self.entries.lock().expect("in-flight tracker poisoned");
        for flag in entries.values() {
            flag.set();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("in-flight tracker poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_visible_until_removed() {
        let tracker = InFlightTracker::new();
        let flag = tracker.add("m1");
        assert!(!flag.is_cancelled());

        assert!(tracker.cancel("m1"));
        assert!(flag.is_cancelled());
        assert!(tracker.is_cancelled("m1"));
        // stays cancelled until removal
        assert!(tracker.is_cancelled("m1"));

        tracker.remove("m1");
        assert!(!tracker.is_cancelled("m1"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn cancel_unknown_id_reports_false() {
        let tracker = InFlightTracker::new();
        assert!(!tracker.cancel("nope"));
    }

    #[test]
    fn cancel_all_flips_every_flag() {
        let tracker = InFlightTracker::new();
        let a = tracker.add("a");
        let b = tracker.add("b");
        tracker.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
