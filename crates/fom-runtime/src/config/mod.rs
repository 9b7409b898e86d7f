//! Domain configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (`from_env`)
//! 3. Library defaults ([`defaults`])
//!
//! # Example
//!
//! ```rust,ignore
//! use fom_runtime::config::DomainConfig;
//!
//! let config = DomainConfig::from_env()
//!     .nr_localities(4)
//!     .threads_per_locality(2);
//! ```

pub mod defaults;

use std::time::Duration;

use fom_core::constants::{MAX_LOCALITIES, MAX_THREADS_PER_LOCALITY};
use fom_core::env::{env_get, env_get_bool};
use fom_core::ConfigError;

/// Prefix of the environment variables read by [`DomainConfig::from_env`]
pub const ENV_PREFIX: &str = "FOM_";

/// Domain configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    /// Number of localities; 0 picks one per online CPU
    pub nr_localities: usize,
    /// Nominal handler threads per locality
    pub threads_per_locality: usize,
    /// Overflow threads a locality may add while FOMs are blocked
    pub max_overflow_threads: usize,
    /// Longest time an idle handler thread parks before re-checking
    pub park_timeout: Duration,
    /// How often waiting FOMs are checked against the time-is-out policy
    pub timeout_scan_interval: Duration,
    /// Pin locality `i` to CPU `i % nr_cpus`
    pub bind_cores: bool,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DomainConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `FOM_NR_LOCALITIES` - Number of localities (0 = CPU count)
    /// - `FOM_THREADS_PER_LOCALITY` - Nominal threads per locality
    /// - `FOM_MAX_OVERFLOW_THREADS` - Overflow threads per locality
    /// - `FOM_PARK_TIMEOUT_MS` - Idle park timeout in milliseconds
    /// - `FOM_TIMEOUT_SCAN_MS` - Time-is-out scan interval in milliseconds
    /// - `FOM_BIND_CORES` - Bind localities to CPUs (0/1, true/false)
    pub fn from_env() -> Self {
        Self::from_env_prefixed(ENV_PREFIX)
    }

    /// Like [`from_env`](Self::from_env), reading `{prefix}NR_LOCALITIES`
    /// and so on; lets several domains in one process be configured apart.
    pub fn from_env_prefixed(prefix: &str) -> Self {
        let key = |name: &str| format!("{prefix}{name}");
        Self {
            nr_localities: env_get(&key("NR_LOCALITIES"), defaults::NR_LOCALITIES),
            threads_per_locality: env_get(
                &key("THREADS_PER_LOCALITY"),
                defaults::THREADS_PER_LOCALITY,
            ),
            max_overflow_threads: env_get(
                &key("MAX_OVERFLOW_THREADS"),
                defaults::MAX_OVERFLOW_THREADS,
            ),
            park_timeout: Duration::from_millis(env_get(
                &key("PARK_TIMEOUT_MS"),
                defaults::PARK_TIMEOUT_MS,
            )),
            timeout_scan_interval: Duration::from_millis(env_get(
                &key("TIMEOUT_SCAN_MS"),
                defaults::TIMEOUT_SCAN_MS,
            )),
            bind_cores: env_get_bool(&key("BIND_CORES"), defaults::BIND_CORES),
        }
    }

    /// Create config with library defaults only (no env override).
    /// Useful for tests.
    pub fn new() -> Self {
        Self {
            nr_localities: defaults::NR_LOCALITIES,
            threads_per_locality: defaults::THREADS_PER_LOCALITY,
            max_overflow_threads: defaults::MAX_OVERFLOW_THREADS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            timeout_scan_interval: Duration::from_millis(defaults::TIMEOUT_SCAN_MS),
            bind_cores: defaults::BIND_CORES,
        }
    }

    // Builder methods

    pub fn nr_localities(mut self, n: usize) -> Self {
        self.nr_localities = n;
        self
    }

    pub fn threads_per_locality(mut self, n: usize) -> Self {
        self.threads_per_locality = n;
        self
    }

    pub fn max_overflow_threads(mut self, n: usize) -> Self {
        self.max_overflow_threads = n;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn timeout_scan_interval(mut self, d: Duration) -> Self {
        self.timeout_scan_interval = d;
        self
    }

    pub fn bind_cores(mut self, enable: bool) -> Self {
        self.bind_cores = enable;
        self
    }

    /// Number of localities the domain will actually create
    pub fn effective_localities(&self) -> usize {
        if self.nr_localities > 0 {
            return self.nr_localities;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(defaults::MAX_AUTO_LOCALITIES)
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nr_localities > MAX_LOCALITIES {
            return Err(ConfigError::InvalidValue("nr_localities must be <= 65536"));
        }
        if self.threads_per_locality == 0 {
            return Err(ConfigError::InvalidValue("threads_per_locality must be > 0"));
        }
        if self.threads_per_locality == 1 && self.max_overflow_threads == 0 {
            return Err(ConfigError::InvalidValue(
                "max_overflow_threads must be > 0 with a single handler thread",
            ));
        }
        if self.threads_per_locality + self.max_overflow_threads > MAX_THREADS_PER_LOCALITY {
            return Err(ConfigError::InvalidValue(
                "threads_per_locality + max_overflow_threads must be <= 256",
            ));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        if self.timeout_scan_interval.is_zero() {
            return Err(ConfigError::InvalidValue("timeout_scan_interval must be > 0"));
        }
        Ok(())
    }

    /// Log the configuration at debug level
    pub fn log(&self) {
        tracing::debug!(
            nr_localities = self.effective_localities(),
            threads_per_locality = self.threads_per_locality,
            max_overflow_threads = self.max_overflow_threads,
            park_timeout = ?self.park_timeout,
            timeout_scan_interval = ?self.timeout_scan_interval,
            bind_cores = self.bind_cores,
            "domain configuration"
        );
    }
}
