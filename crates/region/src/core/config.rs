//! Configuration for the allocator, the pools and the process-wide system
//!
//! Every config has `Default`, a `validate()` and a `from_env()` that reads
//! `NEBULA_REGION_*` variables on top of the defaults.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use super::types::{POISON_BYTE, boundary};
use crate::error::{MemoryError, MemoryResult};
use crate::utils::is_aligned;

// ============================================================================
// Pool Mode
// ============================================================================

/// Allocation backend used by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolMode {
    /// Bump allocation inside blocks borrowed from the allocator
    Bump,
    /// One system-heap call per allocation, recorded for lookups and poisoned on clear
    Debug,
}

impl Default for PoolMode {
    fn default() -> Self {
        if cfg!(feature = "debug-pools") {
            Self::Debug
        } else {
            Self::Bump
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bump => f.write_str("bump"),
            Self::Debug => f.write_str("debug"),
        }
    }
}

impl FromStr for PoolMode {
    type Err = MemoryError;

    fn from_str(value: &str) -> MemoryResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bump" | "production" => Ok(Self::Bump),
            "debug" | "tracked" => Ok(Self::Debug),
            other => Err(MemoryError::invalid_config(&format!(
                "unknown pool mode '{other}'"
            ))),
        }
    }
}

// ============================================================================
// Allocator Configuration
// ============================================================================

/// Allocator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Floor for every block size; a non-zero multiple of the boundary unit
    pub min_block_size: usize,

    /// Bytes of free blocks kept for reuse; `None` keeps everything
    pub retention_cap: Option<usize>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min_block_size: boundary::MIN_ALLOC,
            retention_cap: None,
        }
    }
}

impl AllocatorConfig {
    /// Validate configuration
    pub fn validate(&self) -> MemoryResult<()> {
        if self.min_block_size == 0 {
            return Err(MemoryError::invalid_config(
                "min_block_size cannot be zero",
            ));
        }

        if !is_aligned(self.min_block_size, boundary::BOUNDARY_SIZE) {
            return Err(MemoryError::invalid_config(
                "min_block_size must be a multiple of the boundary size",
            ));
        }

        Ok(())
    }

    /// Defaults overridden by `NEBULA_REGION_MIN_BLOCK_SIZE` and
    /// `NEBULA_REGION_RETENTION_CAP` (`unlimited` clears the cap)
    pub fn from_env() -> MemoryResult<Self> {
        let mut config = Self::default();

        if let Some(size) = env_value::<usize>("NEBULA_REGION_MIN_BLOCK_SIZE")? {
            config.min_block_size = size;
        }

        if let Ok(cap) = std::env::var("NEBULA_REGION_RETENTION_CAP") {
            config.retention_cap = parse_retention_cap(&cap)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_retention_cap(value: &str) -> MemoryResult<Option<usize>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| MemoryError::invalid_config("Invalid NEBULA_REGION_RETENTION_CAP"))
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Pool configuration, inherited by every child of a root pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Allocation backend
    pub mode: PoolMode,

    /// Byte written over tracked allocations before they are freed
    pub poison_byte: Option<u8>,

    /// Reject calls from threads other than the creating one
    pub verify_owner_thread: bool,

    /// Log create/clear/destroy at info instead of debug
    pub log_events: bool,

    /// Upper bound on waiting for `AfterTimeout` subprocesses
    pub kill_timeout: Duration,

    /// First sleep of the subprocess poll loop; doubles each round
    pub kill_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::default(),
            poison_byte: Some(POISON_BYTE),
            verify_owner_thread: false,
            log_events: false,
            kill_timeout: Duration::from_secs(3),
            kill_poll_interval: Duration::from_micros(46_875),
        }
    }
}

impl PoolConfig {
    /// Bump backend, no instrumentation
    pub fn production() -> Self {
        Self {
            mode: PoolMode::Bump,
            poison_byte: None,
            ..Self::default()
        }
    }

    /// Instrumented backend with poisoning and lifecycle logging
    pub fn debug() -> Self {
        Self {
            mode: PoolMode::Debug,
            poison_byte: Some(POISON_BYTE),
            verify_owner_thread: true,
            log_events: true,
            ..Self::default()
        }
    }

    /// Same config with a different backend
    #[must_use]
    pub fn with_mode(mut self, mode: PoolMode) -> Self {
        self.mode = mode;
        self
    }

    /// Same config with different subprocess timing
    #[must_use]
    pub fn with_kill_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.kill_timeout = timeout;
        self.kill_poll_interval = poll_interval;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> MemoryResult<()> {
        if self.kill_poll_interval.is_zero() {
            return Err(MemoryError::invalid_config(
                "kill_poll_interval must be non-zero",
            ));
        }

        if self.kill_poll_interval > self.kill_timeout {
            return Err(MemoryError::invalid_config(
                "kill_poll_interval cannot exceed kill_timeout",
            ));
        }

        Ok(())
    }

    /// Defaults overridden by `NEBULA_REGION_POOL_MODE` (`bump` or `debug`)
    pub fn from_env() -> MemoryResult<Self> {
        let mut config = Self::default();

        if let Some(mode) = env_value::<PoolMode>("NEBULA_REGION_POOL_MODE")? {
            config = match mode {
                PoolMode::Bump => Self::production(),
                PoolMode::Debug => Self::debug(),
            };
        }

        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// System Configuration
// ============================================================================

/// Configuration of the process-wide root pool and its allocator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemConfig {
    pub allocator: AllocatorConfig,
    pub pool: PoolConfig,
}

impl SystemConfig {
    /// Validate both halves
    pub fn validate(&self) -> MemoryResult<()> {
        debug!("Validating region configuration");

        self.allocator
            .validate()
            .map_err(|e| MemoryError::invalid_config(&format!("allocator: {e}")))?;
        self.pool
            .validate()
            .map_err(|e| MemoryError::invalid_config(&format!("pool: {e}")))?;
        Ok(())
    }

    /// Read both halves from the environment
    pub fn from_env() -> MemoryResult<Self> {
        Ok(Self {
            allocator: AllocatorConfig::from_env()?,
            pool: PoolConfig::from_env()?,
        })
    }
}

fn env_value<T: FromStr>(name: &str) -> MemoryResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MemoryError::invalid_config(&format!("Invalid {name}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_validate() {
        assert!(SystemConfig::default().validate().is_ok());
        assert!(PoolConfig::production().validate().is_ok());
        assert!(PoolConfig::debug().validate().is_ok());
    }

    #[test]
    fn zero_min_block_is_rejected() {
        let config = AllocatorConfig {
            min_block_size: 0,
            ..AllocatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_block_must_be_whole_units() {
        let config = AllocatorConfig {
            min_block_size: boundary::BOUNDARY_SIZE + 1,
            ..AllocatorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AllocatorConfig {
            min_block_size: boundary::BOUNDARY_SIZE,
            ..AllocatorConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn poll_interval_must_fit_timeout() {
        let config = PoolConfig::default()
            .with_kill_timing(Duration::from_millis(1), Duration::from_millis(5));
        assert!(config.validate().is_err());

        let config = PoolConfig::default().with_kill_timing(Duration::ZERO, Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_mode_parses_names() {
        assert_eq!("bump".parse::<PoolMode>().unwrap(), PoolMode::Bump);
        assert_eq!(" Debug ".parse::<PoolMode>().unwrap(), PoolMode::Debug);
        assert!("arena".parse::<PoolMode>().is_err());
    }

    #[test]
    fn retention_cap_parses_unlimited() {
        assert_eq!(parse_retention_cap("unlimited").unwrap(), None);
        assert_eq!(parse_retention_cap("16384").unwrap(), Some(16384));
        assert!(parse_retention_cap("lots").is_err());
    }

    #[test]
    fn presets_pick_backends() {
        assert_eq!(PoolConfig::production().mode, PoolMode::Bump);
        assert_eq!(PoolConfig::debug().mode, PoolMode::Debug);
        assert!(PoolConfig::debug().verify_owner_thread);
    }
}
