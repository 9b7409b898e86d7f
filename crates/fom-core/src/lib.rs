//! # fom-core
//!
//! Core types for the FOM (fop state machine) scheduler.
//!
//! This crate is platform-agnostic and contains no threading code.
//! The scheduler itself (localities, domain, callbacks, timers) lives in
//! `fom-runtime`.
//!
//! ## Modules
//!
//! - `id` - FOM and locality handles
//! - `state` - run state, phase and tick outcome
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::{FomId, LocalityId};
pub use state::{Phase, RunState, TickOutcome};
pub use error::{ConfigError, FomError, FomResult};
pub use env::{env_get, env_get_bool};

/// Scheduler-wide limits
pub mod constants {
    /// Maximum number of localities in one domain.
    ///
    /// Bounded by the 16 locality bits of [`FomId`](crate::FomId).
    pub const MAX_LOCALITIES: usize = 1 << 16;

    /// Maximum worker threads a single locality may run at once
    /// (nominal + overflow).
    pub const MAX_THREADS_PER_LOCALITY: usize = 256;
}
