//! Domain: the fixed set of localities serving one request handler
//!
//! ```text
//!                      DomainHandle (clone, Send + Sync)
//!                            │ queue / wakeup / post
//!          ┌─────────────────┼─────────────────┐
//!          ▼                 ▼                 ▼
//!      Locality 0        Locality 1   ...  Locality N-1
//!   ┌──────────────┐  ┌──────────────┐
//!   │ group lock   │  │ group lock   │
//!   │ run queue    │  │ run queue    │
//!   │ wait list    │  │ wait list    │
//!   │ AST queue    │  │ AST queue    │
//!   │ timers       │  │ timers       │
//!   └──────┬───────┘  └──────┬───────┘
//!     handler threads   handler threads
//! ```
//!
//! A thread never holds two group locks. Work aimed at another locality
//! from a thread that already holds one is posted as an AST.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fom_core::{FomId, FomResult, LocalityId, Phase};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::affinity;
use crate::ast::Ast;
use crate::config::DomainConfig;
use crate::fom::{AstContext, Fom, FomInfo};
use crate::locality::{Locality, LocalitySettings, LocalityStats};
use crate::tls;

/// What a [`DomainPolicy`] sees of a waiting FOM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingFom {
    pub id: FomId,
    pub phase: Phase,
    pub transitions: u64,
    pub waiting_since: Instant,
    /// Set through [`FomContext::set_deadline`](crate::FomContext::set_deadline)
    pub deadline: Option<Instant>,
}

/// Domain-wide scheduling decisions
pub trait DomainPolicy: Send + Sync + 'static {
    /// Locality index for a FOM about to be queued; reduced modulo
    /// `nr_localities` by the caller
    fn home_locality(&self, fom: &dyn Fom, nr_localities: usize) -> usize {
        fom.home_locality(nr_localities)
    }

    /// Whether a waiting FOM should be moved to its timeout phase
    fn time_is_out(&self, fom: &WaitingFom, now: Instant) -> bool {
        fom.deadline.map_or(false, |deadline| now >= deadline)
    }
}

/// FOM-chosen home locality, deadline-based timeouts
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl DomainPolicy for DefaultPolicy {}

pub(crate) struct DomainShared {
    localities: Vec<Arc<Locality>>,
    policy: Arc<dyn DomainPolicy>,
    config: DomainConfig,
    /// FOMs queued and not yet finalised, counted from `queue` on
    active: AtomicUsize,
    idle_lock: Mutex<()>,
    idle_cond: Condvar,
}

impl DomainShared {
    pub(crate) fn release(&self, n: usize) {
        let prev = self.active.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "domain released {n} of {prev} foms");
        if prev == n {
            let _guard = self.idle_lock.lock();
            self.idle_cond.notify_all();
        }
    }
}

/// Cheap, clonable handle to a running domain
#[derive(Clone)]
pub struct DomainHandle {
    shared: Arc<DomainShared>,
}

impl DomainHandle {
    pub(crate) fn from_shared(shared: Arc<DomainShared>) -> Self {
        Self { shared }
    }

    fn locality(&self, id: LocalityId) -> Option<&Arc<Locality>> {
        self.shared.localities.get(id.as_usize())
    }

    #[inline]
    pub fn nr_localities(&self) -> usize {
        self.shared.localities.len()
    }

    pub fn config(&self) -> &DomainConfig {
        &self.shared.config
    }

    /// Queue a freshly created FOM on its home locality
    ///
    /// The home locality is chosen once, by the domain policy. From a thread
    /// holding a group lock the FOM travels as an AST; the returned id is
    /// valid immediately either way.
    pub fn queue(&self, fom: Box<dyn Fom>) -> FomId {
        let nr = self.nr_localities();
        let idx = self.shared.policy.home_locality(fom.as_ref(), nr) % nr;
        let loc = &self.shared.localities[idx];
        let id = loc.alloc_id();
        self.shared.active.fetch_add(1, Ordering::AcqRel);

        if tls::holds_group_lock() {
            loc.post_enqueue(id, fom);
        } else {
            let mut st = loc.lock();
            loc.insert(&mut st, id, fom);
            drop(st);
            loc.signal();
        }
        id
    }

    /// Make a waiting FOM ready
    ///
    /// A no-op for READY FOMs and for ids that are no longer queued. A
    /// wakeup of a RUNNING FOM takes effect once it returns `Wait`.
    pub fn wakeup(&self, id: FomId) {
        let Some(loc) = self.locality(id.locality()) else {
            return;
        };
        if tls::holds_group_lock() {
            loc.post(Ast::Wakeup(id));
            return;
        }
        let woken = {
            let mut st = loc.lock();
            loc.wakeup_locked(&mut st, id)
        };
        if woken {
            loc.signal();
        }
    }

    /// Run `f` under the home locality's lock on behalf of FOM `id`
    ///
    /// Never concurrent with the FOM's transitions; if the FOM is RUNNING,
    /// `f` runs after it returns `Wait`. Dropped if the FOM finished.
    pub fn post<F>(&self, id: FomId, f: F)
    where
        F: FnOnce(&mut AstContext<'_>) + Send + 'static,
    {
        if let Some(loc) = self.locality(id.locality()) {
            loc.post(Ast::Closure {
                fom: id,
                f: Box::new(f),
            });
        }
    }

    /// Number of FOMs queued and not yet finalised
    ///
    /// Includes FOMs still on their way to their home locality.
    pub fn active_foms(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Racy sample: no FOM queued and not yet finalised
    ///
    /// A FOM's children are counted before the FOM itself is finalised, so
    /// the domain cannot look idle while work is being handed around.
    pub fn is_idle(&self) -> bool {
        self.active_foms() == 0
    }

    /// Wait until the domain is idle; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.idle_lock.lock();
        loop {
            if self.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared.idle_cond.wait_for(&mut guard, deadline - now);
        }
    }

    /// Phase and run state of a queued FOM
    ///
    /// Takes the home locality's lock: not callable from a transition or a
    /// bottom-half.
    pub fn fom_info(&self, id: FomId) -> Option<FomInfo> {
        self.locality(id.locality())?.fom_info(id)
    }

    /// Counters of locality `idx`
    pub fn locality_stats(&self, idx: usize) -> Option<LocalityStats> {
        self.shared.localities.get(idx).map(|l| l.stats())
    }

    /// Check list membership, run states and counters of every locality
    pub fn check_invariants(&self) -> FomResult<()> {
        for loc in &self.shared.localities {
            loc.check()?;
        }
        Ok(())
    }
}

impl fmt::Debug for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainHandle")
            .field("nr_localities", &self.nr_localities())
            .field("active_foms", &self.active_foms())
            .finish()
    }
}

/// Owner of a set of localities and their handler threads
///
/// Dereferences to [`DomainHandle`] for scheduling operations.
pub struct Domain {
    handle: DomainHandle,
    stopped: bool,
}

impl Domain {
    /// Create the localities and start their handler threads
    pub fn new(config: DomainConfig, policy: Arc<dyn DomainPolicy>) -> FomResult<Self> {
        config.validate()?;
        config.log();

        let nr = config.effective_localities();
        let cpus = affinity::online_cpus();
        let settings = |idx: usize| LocalitySettings {
            nominal_threads: config.threads_per_locality,
            max_overflow_threads: config.max_overflow_threads,
            park_timeout: config.park_timeout,
            scan_interval: config.timeout_scan_interval,
            cpu: config.bind_cores.then_some(idx % cpus),
        };

        let shared = Arc::new_cyclic(|weak| DomainShared {
            localities: (0..nr)
                .map(|idx| {
                    Locality::new(
                        LocalityId::new(idx as u16),
                        settings(idx),
                        Arc::clone(&policy),
                        weak.clone(),
                    )
                })
                .collect(),
            policy: Arc::clone(&policy),
            config: config.clone(),
            active: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle_cond: Condvar::new(),
        });

        let mut domain = Domain {
            handle: DomainHandle::from_shared(shared),
            stopped: false,
        };
        for loc in &domain.handle.shared.localities {
            if let Err(err) = loc.start() {
                domain.stop();
                return Err(err);
            }
        }
        info!(
            nr_localities = nr,
            threads_per_locality = config.threads_per_locality,
            "domain started"
        );
        Ok(domain)
    }

    /// Domain with [`DefaultPolicy`]
    pub fn with_default_policy(config: DomainConfig) -> FomResult<Self> {
        Self::new(config, Arc::new(DefaultPolicy))
    }

    /// Another handle to this domain
    pub fn handle(&self) -> DomainHandle {
        self.handle.clone()
    }

    /// Stop and join every handler thread
    ///
    /// # Panics
    ///
    /// If FOMs are still active, or when called on a handler thread.
    pub fn fini(mut self) {
        if let Some((locality, worker)) = tls::current_worker() {
            panic!("domain finalised on handler thread {worker} of {locality}");
        }
        let active = self.active_foms();
        assert!(active == 0, "domain finalised with {active} active foms");
        self.stop();
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for loc in &self.handle.shared.localities {
            loc.stop();
        }
        debug!(nr_localities = self.nr_localities(), "domain stopped");
    }
}

impl Deref for Domain {
    type Target = DomainHandle;

    fn deref(&self) -> &DomainHandle {
        &self.handle
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.handle, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fom_core::TickOutcome;

    struct Homed(usize);

    impl Fom for Homed {
        fn tick(&mut self, _ctx: &mut crate::FomContext<'_>) -> TickOutcome {
            TickOutcome::Wait
        }

        fn home_locality(&self, _nr: usize) -> usize {
            self.0
        }
    }

    #[test]
    fn test_default_policy_time_is_out() {
        let now = Instant::now();
        let mut w = WaitingFom {
            id: FomId::new(LocalityId::new(0), 1),
            phase: Phase::INIT,
            transitions: 1,
            waiting_since: now,
            deadline: None,
        };
        assert!(!DefaultPolicy.time_is_out(&w, now));
        w.deadline = Some(now + Duration::from_secs(1));
        assert!(!DefaultPolicy.time_is_out(&w, now));
        assert!(DefaultPolicy.time_is_out(&w, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_default_policy_home_locality() {
        assert_eq!(DefaultPolicy.home_locality(&Homed(3), 4), 3);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = DomainConfig::new().threads_per_locality(0);
        assert!(Domain::with_default_policy(config).is_err());
    }

    #[test]
    fn test_start_and_fini() {
        let domain = Domain::with_default_policy(DomainConfig::new().nr_localities(2)).unwrap();
        assert_eq!(domain.nr_localities(), 2);
        assert!(domain.is_idle());
        assert!(domain.wait_idle(Duration::from_millis(10)));
        assert!(domain.check_invariants().is_ok());
        assert!(domain.locality_stats(2).is_none());
        domain.fini();
    }
}
