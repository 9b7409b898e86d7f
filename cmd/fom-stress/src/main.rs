//! Stress test - many FOMs through a request handler
//!
//! Queues N fops (default 100_000) across all localities. Every FOM takes a
//! few transitions, waits on a shared channel that a separate thread keeps
//! signalling, and finishes. Localities and thread counts come from the
//! `FOM_*` environment variables; log output from `RUST_LOG`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fom_runtime::{Chan, DomainConfig, FiniInfo, Fom, FomContext, FomResult, Phase, TickOutcome};
use reqh::{Fop, FopType, RequestHandler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const WORK: FopType = FopType::new("work", 1);
const PH_WAITING: Phase = Phase::type_specific(0);

struct Work {
    seq: u64,
    chan: Arc<Chan>,
    completed: Arc<AtomicU64>,
}

impl Fom for Work {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        match ctx.phase() {
            Phase::INIT if ctx.transitions() < 4 => TickOutcome::Again,
            Phase::INIT => {
                ctx.wait_on(&self.chan);
                ctx.set_phase(PH_WAITING);
                TickOutcome::Wait
            }
            _ => {
                ctx.set_phase(Phase::FINISH);
                TickOutcome::Wait
            }
        }
    }

    fn home_locality(&self, nr: usize) -> usize {
        self.seq as usize % nr
    }

    fn fini(self: Box<Self>, _info: FiniInfo) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "work"
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let nr_foms: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100_000);

    let reqh = match RequestHandler::with_default_policy(DomainConfig::from_env()) {
        Ok(reqh) => reqh,
        Err(err) => {
            error!(%err, "cannot start request handler");
            std::process::exit(1);
        }
    };

    let chan = Arc::new(Chan::new());
    let completed = Arc::new(AtomicU64::new(0));
    let factory = {
        let chan = Arc::clone(&chan);
        let completed = Arc::clone(&completed);
        move |fop: Fop| -> FomResult<Box<dyn Fom>> {
            let seq = fop.payload::<u64>().copied().unwrap_or_default();
            Ok(Box::new(Work {
                seq,
                chan: Arc::clone(&chan),
                completed: Arc::clone(&completed),
            }))
        }
    };
    if let Err(err) = reqh.register_fom_type(WORK, Arc::new(factory)) {
        error!(%err, "cannot register fom type");
        std::process::exit(1);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let signaller = {
        let chan = Arc::clone(&chan);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if chan.broadcast() == 0 {
                    std::thread::sleep(Duration::from_micros(200));
                }
            }
        })
    };

    info!(nr_foms, localities = reqh.domain().nr_localities(), "queueing fops");
    let start = Instant::now();
    for seq in 0..nr_foms {
        if let Err(err) = reqh.fop_handle(Fop::new(WORK.opcode, seq)) {
            error!(%err, seq, "fop rejected");
            std::process::exit(1);
        }
    }
    let queue_time = start.elapsed();

    let drained = reqh.shutdown(Duration::from_secs(60));
    let total = start.elapsed();
    stop.store(true, Ordering::Relaxed);
    if signaller.join().is_err() {
        error!("signaller thread panicked");
    }

    let domain = reqh.domain();
    for idx in 0..domain.nr_localities() {
        if let Some(stats) = domain.locality_stats(idx) {
            info!(
                locality = %stats.id,
                ticks = stats.ticks,
                asts = stats.asts,
                overflow = stats.overflow_spawned,
                timers_fired = stats.timers.fired,
                "locality"
            );
        }
    }
    info!(
        completed = completed.load(Ordering::Relaxed),
        ?queue_time,
        ?total,
        foms_per_sec = (nr_foms as f64 / total.as_secs_f64()) as u64,
        "done"
    );

    if !drained {
        error!(active = domain.active_foms(), "domain did not drain");
        std::process::exit(1);
    }
    drop(domain);
    reqh.fini();
}
