//! Library defaults for [`DomainConfig`](super::DomainConfig)
//!
//! Every value can be overridden at runtime through the matching `FOM_*`
//! environment variable, see [`DomainConfig::from_env`](super::DomainConfig::from_env).

/// Number of localities (0 = one per online CPU)
pub const NR_LOCALITIES: usize = 0;

/// Nominal handler threads per locality
pub const THREADS_PER_LOCALITY: usize = 1;

/// Extra threads a locality may start while FOMs block
pub const MAX_OVERFLOW_THREADS: usize = 16;

/// Upper bound on how long an idle handler thread sleeps
pub const PARK_TIMEOUT_MS: u64 = 100;

/// Interval between time-is-out scans of the wait-list
pub const TIMEOUT_SCAN_MS: u64 = 50;

/// Bind each locality's threads to one CPU
pub const BIND_CORES: bool = false;

/// Upper bound for `nr_localities` when derived from the CPU count
pub const MAX_AUTO_LOCALITIES: usize = 64;
