//! Linux futex-based rerun signal
//!
//! Futex word semantics:
//! - 0 = no signal pending
//! - 1 = signal pending (a parked thread should re-check for work)
//!
//! `wake_*` always stores 1 before issuing `FUTEX_WAKE`; `park` swaps the
//! word back to 0 and only sleeps while it reads 0.

use super::RerunSignal;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Futex-based rerun signal
pub struct FutexSignal {
    futex: AtomicU32,
    parked: AtomicUsize,
}

impl FutexSignal {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn futex_wake(&self, n: i32) {
        // SAFETY: the futex word lives as long as `self`
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RerunSignal for FutexSignal {
    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.futex.swap(0, Ordering::AcqRel) != 0 {
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // SAFETY: FUTEX_WAIT only sleeps while the word still reads 0
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }

        self.parked.fetch_sub(1, Ordering::SeqCst);

        // ETIMEDOUT, EAGAIN and EINTR all land here; the flag decides
        self.futex.swap(0, Ordering::AcqRel) != 0
    }

    fn wake_one(&self) {
        self.futex.store(1, Ordering::Release);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.futex_wake(1);
        }
    }

    fn wake_all(&self) {
        self.futex.store(1, Ordering::Release);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.futex_wake(i32::MAX);
        }
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
