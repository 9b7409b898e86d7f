//! Shared helpers for the runtime integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fom_runtime::{Domain, DomainConfig, FiniInfo, Fom, FomContext, Phase, TickOutcome};

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Small domain with short park and scan intervals
pub fn domain(nr_localities: usize) -> Domain {
    let config = DomainConfig::new()
        .nr_localities(nr_localities)
        .threads_per_locality(1)
        .max_overflow_threads(4)
        .park_timeout(Duration::from_millis(20))
        .timeout_scan_interval(Duration::from_millis(5));
    Domain::with_default_policy(config).expect("domain start")
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Counts finalisations
#[derive(Clone, Default)]
pub struct FiniCounter(Arc<AtomicUsize>);

impl FiniCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returns `Again` a fixed number of times, then finishes
pub struct Spinner {
    pub again: u64,
    pub home: usize,
    pub fini: FiniCounter,
}

impl Fom for Spinner {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        if ctx.transitions() <= self.again {
            return TickOutcome::Again;
        }
        ctx.set_phase(Phase::FINISH);
        TickOutcome::Wait
    }

    fn home_locality(&self, _nr: usize) -> usize {
        self.home
    }

    fn fini(self: Box<Self>, info: FiniInfo) {
        assert_eq!(info.transitions, self.again + 1);
        self.fini.bump();
    }

    fn name(&self) -> &'static str {
        "spinner"
    }
}
