//! Per-locality timers and FOM timeouts
//!
//! Every locality owns one [`TimerBackend`]. Its handler threads poll it
//! on each scheduler iteration and sleep no longer than the next deadline.
//! An expired entry fires its callback through the same top-half/bottom-half
//! path a [`Chan`](crate::Chan) uses.
//!
//! ```text
//!   FomContext::timeout_arm ──insert──► HeapTimerBackend
//!                                             │ poll_expired (handler loop)
//!                                             ▼
//!                                   CallbackInner::fire ──► AST queue
//! ```

mod entry;
mod heap;

pub use entry::{TimerEntry, TimerHandle};
pub use heap::{HeapTimerBackend, TimerStats};

use std::fmt;
use std::sync::Weak;
use std::time::Instant;

use parking_lot::Mutex;

use crate::callback::{Callback, CallbackState, CancelOutcome};
use crate::fom::AstContext;
use crate::locality::Locality;

/// Timer storage used by a locality
pub trait TimerBackend: Send + Sync {
    /// Insert a timer entry, returns handle for cancellation
    fn insert(&self, entry: TimerEntry) -> TimerHandle;

    /// Cancel a timer; false when it already fired or was never inserted
    fn cancel(&self, handle: TimerHandle) -> bool;

    /// Remove and return every entry with `deadline <= now`
    fn poll_expired(&self, now: Instant) -> Vec<TimerEntry>;

    /// Deadline of the earliest live entry
    fn next_deadline(&self) -> Option<Instant>;

    /// Number of live timers
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// A callback bound to a deadline instead of a signal source
pub struct Timeout {
    callback: Callback,
    armed: Mutex<Option<(TimerHandle, Weak<Locality>)>>,
}

impl Timeout {
    pub fn new<B>(bottom: B) -> Self
    where
        B: FnMut(&mut AstContext<'_>) + Send + 'static,
    {
        Self::from_callback(Callback::new(bottom))
    }

    /// Timeout whose expiry only makes the FOM ready
    pub fn wakeup() -> Self {
        Self::from_callback(Callback::wakeup())
    }

    pub fn from_callback(callback: Callback) -> Self {
        Self {
            callback,
            armed: Mutex::new(None),
        }
    }

    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    pub fn state(&self) -> CallbackState {
        self.callback.state()
    }

    /// Cancel the timeout with the same guarantee as [`Callback::cancel`]
    pub fn cancel(&self) -> CancelOutcome {
        let outcome = self.callback.cancel();
        if let Some((handle, locality)) = self.armed.lock().take() {
            if let Some(loc) = locality.upgrade() {
                loc.timers().cancel(handle);
            }
        }
        outcome
    }

    pub(crate) fn set_armed(&self, handle: TimerHandle, locality: Weak<Locality>) {
        *self.armed.lock() = Some((handle, locality));
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("callback", &self.callback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_timeout_cancel() {
        let t = Timeout::wakeup();
        assert_eq!(t.state(), CallbackState::Unarmed);
        assert_eq!(t.cancel(), CancelOutcome::NotArmed);
    }
}
