//! Condvar-based rerun signal for platforms without futex

use super::RerunSignal;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct SignalState {
    /// A signal nobody consumed yet
    pending: bool,
    /// Bumped by `wake_all` so every sleeper leaves, not only the first
    broadcasts: u64,
}

/// Condvar-based rerun signal
pub struct CondvarSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl CondvarSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                pending: false,
                broadcasts: 0,
            }),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }
}

impl Default for CondvarSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RerunSignal for CondvarSignal {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        let seen = state.broadcasts;
        if !state.pending {
            self.parked.fetch_add(1, Ordering::SeqCst);
            let deadline = timeout.map(|t| Instant::now() + t);
            while !state.pending && state.broadcasts == seen {
                match deadline {
                    Some(d) => {
                        if self.condvar.wait_until(&mut state, d).timed_out() {
                            break;
                        }
                    }
                    None => self.condvar.wait(&mut state),
                }
            }
            self.parked.fetch_sub(1, Ordering::SeqCst);
        }
        let woken = state.pending || state.broadcasts != seen;
        state.pending = false;
        woken
    }

    fn wake_one(&self) {
        self.state.lock().pending = true;
        self.condvar.notify_one();
    }

    fn wake_all(&self) {
        {
            let mut state = self.state.lock();
            state.pending = true;
            state.broadcasts = state.broadcasts.wrapping_add(1);
        }
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
