//! Flush-completion signaling.
//!
//! Every in-progress write batch is paired with one [`FlushSignal`]. Callers
//! that contributed to the batch park on the signal; the flush task closes it
//! exactly once, after the batch's sync commit returns.

use std::sync::{Arc, Condvar, Mutex};

/// One-shot broadcast closed when the batch it guards is durable.
pub struct FlushSignal {
    closed: Mutex<bool>,
    cv: Condvar,
}

impl FlushSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// Block until the signal is closed. Returns immediately if it already is.
    pub fn wait(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|p| p.into_inner());
        while !*closed {
            closed = self.cv.wait(closed).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Close the signal and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|p| p.into_inner());
        *closed = true;
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Hands out the flush signal paired with the in-progress batch.
///
/// The engine swaps the signal together with the batch while holding its
/// state lock, so a handle taken under that lock always belongs to the batch
/// the caller wrote into. Notifiers are sharded alongside the key locks only
/// to keep the wake fan-out per condvar small.
pub struct Notifier {
    current: Mutex<Arc<FlushSignal>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(FlushSignal::new()),
        }
    }

    /// Handle to the signal guarding the in-progress batch.
    pub fn current(&self) -> Arc<FlushSignal> {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&current)
    }

    /// Install a fresh open signal and return the retired one.
    ///
    /// The caller is expected to close the returned signal once the batch it
    /// guarded is durable.
    pub fn rotate(&self) -> Arc<FlushSignal> {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *current, FlushSignal::new())
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
