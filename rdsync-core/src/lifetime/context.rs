//! Execution Context
//!
//! Tracks which lifetimes are currently inside `execute_if_alive` on this
//! thread. Termination consults it so that a lifetime terminated from inside
//! its own guarded execution does not wait for itself.
//!
//! # Implementation
//!
//! A thread-local stack of lifetime ids. Entering an execution pushes the id,
//! the returned guard pops it when dropped, including during unwinding.

use std::cell::RefCell;

use smallvec::SmallVec;

thread_local! {
    static EXECUTING: RefCell<SmallVec<[u64; 4]>> = RefCell::new(SmallVec::new());
}

/// Guard that pops the execution entry when dropped.
pub(crate) struct ExecutionContext {
    lifetime_id: u64,
}

impl ExecutionContext {
    /// Record that the current thread executes under the given lifetime.
    pub(crate) fn enter(lifetime_id: u64) -> Self {
        EXECUTING.with(|stack| stack.borrow_mut().push(lifetime_id));
        Self { lifetime_id }
    }

    /// Number of active executions of the lifetime on the current thread.
    pub(crate) fn depth_on_current_thread(lifetime_id: u64) -> usize {
        EXECUTING.with(|stack| stack.borrow().iter().filter(|id| **id == lifetime_id).count())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        EXECUTING.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(
                popped,
                Some(self.lifetime_id),
                "ExecutionContext mismatch: expected {:?}, got {:?}",
                self.lifetime_id,
                popped
            );
        });
    }
}
