//! Sequential lifetimes: at most one nested lifetime alive at a time.

use parking_lot::Mutex;
use tracing::warn;

use super::definition::Lifetime;

/// Hands out nested lifetimes of `parent`, terminating the previous one each
/// time a new one is requested.
pub struct SequentialLifetimes {
    parent: Lifetime,
    current: Mutex<Lifetime>,
}

impl SequentialLifetimes {
    pub fn new(parent: &Lifetime) -> Self {
        Self { parent: parent.clone(), current: Mutex::new(Lifetime::terminated()) }
    }

    /// Terminate the current lifetime and start a fresh one.
    pub fn next(&self) -> Lifetime {
        self.terminate_current();
        let next = self.parent.create_nested();
        *self.current.lock() = next.clone();
        next
    }

    pub fn terminate_current(&self) {
        let previous = std::mem::replace(&mut *self.current.lock(), Lifetime::terminated());
        if let Err(e) = previous.terminate() {
            warn!(error = %e, "sequential lifetime teardown failed");
        }
    }

    /// `true` when no lifetime handed out by [`next`](Self::next) is alive.
    pub fn is_terminated(&self) -> bool {
        !self.current.lock().is_alive()
    }
}
