//! Round-robin index selection.
//!
//! Used for spreading tasks across zone subnets at launch and for picking a
//! healthy target per request in the balancers.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free round-robin cursor.
#[derive(Debug)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for RoundRobin {
    fn clone(&self) -> Self {
        Self {
            counter: AtomicUsize::new(self.counter.load(Ordering::Relaxed)),
        }
    }
}
