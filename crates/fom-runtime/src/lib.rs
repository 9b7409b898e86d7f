//! # fom-runtime
//!
//! Locality scheduler for FOMs (fop state machines).
//!
//! This crate provides:
//! - Domains of localities, each with its own group lock, run queue and
//!   wait list, served by a small pool of handler threads
//! - The FOM life-cycle: queue, phase transitions, wait, wakeup, finalise
//! - Callbacks with a top-half in the signalling thread and a bottom-half
//!   delivered as an AST under the home locality's lock
//! - Timeouts on a per-locality timer heap
//! - Blocking regions backed by overflow handler threads
//! - A non-blocking reader/writer lock for FOMs
//!
//! ```no_run
//! use fom_runtime::{Domain, DomainConfig, Fom, FomContext, Phase, TickOutcome};
//!
//! struct Hello;
//!
//! impl Fom for Hello {
//!     fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
//!         ctx.set_phase(Phase::FINISH);
//!         TickOutcome::Wait
//!     }
//!
//!     fn home_locality(&self, _nr: usize) -> usize {
//!         0
//!     }
//! }
//!
//! let domain = Domain::with_default_policy(DomainConfig::from_env()).unwrap();
//! domain.queue(Box::new(Hello));
//! domain.wait_idle(std::time::Duration::from_secs(1));
//! domain.fini();
//! ```

pub mod affinity;
pub mod config;
pub mod parking;
pub mod timer;
pub mod tls;

mod ast;
mod callback;
mod domain;
mod fom;
mod locality;
mod long_lock;
mod scheduler;
mod worker;

// Re-exports
pub use ast::AstFn;
pub use callback::{Callback, CallbackState, CancelOutcome, Chan};
pub use config::DomainConfig;
pub use domain::{DefaultPolicy, Domain, DomainHandle, DomainPolicy, WaitingFom};
pub use fom::{AstContext, FiniInfo, Fom, FomContext, FomInfo};
pub use locality::LocalityStats;
pub use long_lock::{LockKind, LockLink, LongLock};
pub use timer::Timeout;

pub use fom_core::{FomError, FomId, FomResult, LocalityId, Phase, RunState, TickOutcome};
