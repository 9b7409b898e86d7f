//! Handler thread pool of one locality
//!
//! Threads are started with a descriptive name (`fom-loc{N}-w{M}`) and
//! their join handles kept until the locality stops. Handles of overflow
//! threads that already retired are reaped whenever a new thread starts.

use std::thread::{self, JoinHandle};

use fom_core::{FomError, FomResult};
use parking_lot::Mutex;
use tracing::warn;

/// Join handles of a locality's handler threads
pub(crate) struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start a named thread running `body`
    pub(crate) fn spawn<F>(&self, name: String, body: F) -> FomResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|err| FomError::WorkerSpawn(format!("{name}: {err}")))?;

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Threads started and not yet reaped
    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Join every thread, including ones started while joining
    pub(crate) fn join_all(&self) {
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let name = handle.thread().name().unwrap_or("?").to_owned();
                if handle.join().is_err() {
                    warn!(thread = %name, "handler thread panicked");
                }
            }
        }
    }
}
