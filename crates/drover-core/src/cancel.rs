//! Cooperative cancellation.
//!
//! A single shared flag, set once and never cleared. Workers check it before
//! each file, before each I/O chunk, and inside mount waits, so cancellation
//! latency is bounded by one chunk transfer or one wait tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
