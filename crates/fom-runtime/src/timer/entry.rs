//! Timer entries

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::callback::CallbackInner;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies one armed timer; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub(crate) u64);

impl TimerHandle {
    pub(crate) fn new() -> Self {
        TimerHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Deadline plus the callback it fires for one arming epoch
#[derive(Clone)]
pub struct TimerEntry {
    pub handle: TimerHandle,
    pub deadline: Instant,
    pub(crate) callback: Arc<CallbackInner>,
    pub(crate) epoch: u64,
}

impl TimerEntry {
    pub(crate) fn new(deadline: Instant, callback: Arc<CallbackInner>, epoch: u64) -> Self {
        Self {
            handle: TimerHandle::new(),
            deadline,
            callback,
            epoch,
        }
    }
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("handle", &self.handle.0)
            .field("deadline", &self.deadline)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_increase() {
        let a = TimerHandle::new();
        let b = TimerHandle::new();
        assert!(b > a);
        assert_ne!(a.raw(), 0);
    }
}
