//! Thread-local scheduler context
//!
//! Records which locality (if any) the current thread holds the group lock
//! of, and which handler thread it is. Used to route cross-locality work
//! through ASTs and to catch self-deadlocks early.

use std::cell::Cell;

use fom_core::LocalityId;

/// Sentinel for "no group lock held"
const NO_LOCK: usize = 0;

thread_local! {
    /// Address of the locality whose group lock this thread holds
    static HELD_LOCK: Cell<usize> = const { Cell::new(NO_LOCK) };

    /// (locality, worker number) of a handler thread
    static WORKER: Cell<Option<(LocalityId, usize)>> = const { Cell::new(None) };
}

/// Record that the lock identified by `key` is now held.
/// Returns the previous holder key for [`release`].
#[inline]
pub(crate) fn acquire(key: usize) -> usize {
    HELD_LOCK.with(|cell| cell.replace(key))
}

/// Restore the holder key returned by [`acquire`]
#[inline]
pub(crate) fn release(prev: usize) {
    HELD_LOCK.with(|cell| cell.set(prev));
}

/// Check whether this thread holds the lock identified by `key`
#[inline]
pub(crate) fn holds(key: usize) -> bool {
    HELD_LOCK.with(|cell| cell.get() == key)
}

/// Check whether this thread holds any group lock
#[inline]
pub fn holds_group_lock() -> bool {
    HELD_LOCK.with(|cell| cell.get() != NO_LOCK)
}

#[inline]
pub(crate) fn set_worker(locality: LocalityId, worker: usize) {
    WORKER.with(|cell| cell.set(Some((locality, worker))));
}

/// Locality and worker number of the current handler thread,
/// `None` on any other thread
#[inline]
pub fn current_worker() -> Option<(LocalityId, usize)> {
    WORKER.with(|cell| cell.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_nesting() {
        assert!(!holds_group_lock());
        let prev = acquire(0x1000);
        assert_eq!(prev, NO_LOCK);
        assert!(holds(0x1000));

        let inner = acquire(0x2000);
        assert!(holds(0x2000));
        assert!(!holds(0x1000));
        release(inner);

        assert!(holds(0x1000));
        release(prev);
        assert!(!holds_group_lock());
    }

    #[test]
    fn test_worker_unset_off_handler_threads() {
        assert!(current_worker().is_none());
        std::thread::spawn(|| {
            set_worker(LocalityId::new(2), 5);
            assert_eq!(current_worker(), Some((LocalityId::new(2), 5)));
        })
        .join()
        .unwrap();
        assert!(current_worker().is_none());
    }
}
