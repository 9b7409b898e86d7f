//! Rerun signal
//!
//! Idle handler threads of a locality sleep on its rerun signal. Anything
//! that makes work available to the locality (a queued FOM, a wakeup, a
//! posted AST, a new timer) signals it.
//!
//! A signal is never lost: `wake_*` leaves a pending flag behind even when no
//! thread is parked, and the next `park` consumes it and returns at once.

use std::time::Duration;

/// Sleep/wake primitive for the handler threads of one locality
pub trait RerunSignal: Send + Sync {
    /// Park until signalled or `timeout` elapses
    ///
    /// Returns `true` when a signal was consumed, `false` on timeout or a
    /// spurious return. Callers re-check for work either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake one parked thread, or leave a pending signal
    fn wake_one(&self);

    /// Wake every parked thread (shutdown)
    fn wake_all(&self);

    /// Number of currently parked threads (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexSignal as PlatformSignal;
    } else {
        mod fallback;
        pub use fallback::CondvarSignal as PlatformSignal;
    }
}

/// Create the platform rerun signal
pub fn new_signal() -> Box<dyn RerunSignal> {
    Box::new(PlatformSignal::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let signal = new_signal();
        let start = Instant::now();
        let woken = signal.park(Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wake_before_park_is_kept() {
        let signal = new_signal();
        signal.wake_one();
        let start = Instant::now();
        assert!(signal.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
        // consumed
        assert!(!signal.park(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wake_one() {
        let signal = Arc::new(PlatformSignal::new());
        let signal2 = Arc::clone(&signal);

        let handle = thread::spawn(move || signal2.park(Some(Duration::from_secs(10))));

        thread::sleep(Duration::from_millis(50));
        signal.wake_one();

        assert!(handle.join().unwrap());
        assert_eq!(signal.parked_count(), 0);
    }

    #[test]
    fn test_wake_all() {
        let signal = Arc::new(PlatformSignal::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let s = Arc::clone(&signal);
                thread::spawn(move || {
                    let start = Instant::now();
                    s.park(Some(Duration::from_secs(10)));
                    start.elapsed()
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        signal.wake_all();

        for h in handles {
            assert!(h.join().unwrap() < Duration::from_secs(5));
        }
    }
}
