//! Global slot accounting.

use std::sync::Mutex;

/// Counts running executions against a fixed ceiling.
///
/// Check-and-reserve happens under one lock, so concurrent callers can never
/// push the count past the limit.
#[derive(Debug)]
pub struct AdmissionController {
    limit: usize,
    in_use: Mutex<usize>,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: Mutex::new(0),
        }
    }

    /// Reserve one slot. `false` leaves the count untouched.
    pub fn try_reserve(&self) -> bool {
        let mut in_use = self.lock();
        if *in_use < self.limit {
            *in_use += 1;
            true
        } else {
            false
        }
    }

    /// Give one slot back. Never goes below zero.
    pub fn release(&self) {
        let mut in_use = self.lock();
        if *in_use == 0 {
            tracing::warn!("Slot released with none in use");
            return;
        }
        *in_use -= 1;
    }

    pub fn in_use(&self) -> usize {
        *self.lock()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        // a bare counter is always consistent
        self.in_use.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
