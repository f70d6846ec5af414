//! # Memory Core Configuration
//!
//! Every tunable of the core, loaded once at startup from TOML.
//!
//! ```toml
//! engine_count = 2
//! enable_allocation_reuse = true
//!
//! [residency]
//! budget_bytes = 268435456
//!
//! [wait]
//! poll_interval_us = 10
//! timeout_ms = 2000
//! ```
//!
//! Missing keys fall back to [`MemoryConfig::default`].

use crate::error::{DriverError, DriverResult};
use gfxmem_shared::{is_aligned, MAX_ENGINES, PAGE_SIZE};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of engines exposed by the device.
    pub engine_count: usize,
    /// When false, `store_for_reuse` destroys instead of recycling.
    pub enable_allocation_reuse: bool,
    /// When false, in-flight releases go to the temporary pool.
    pub enable_deferred_deleter: bool,
    /// Place every allocation in the 32-bit heap.
    pub force_32bit_allocations: bool,
    /// Capacity of the host backend, in bytes.
    pub device_memory_bytes: u64,
    /// Residency settings.
    pub residency: ResidencyConfig,
    /// Fence wait settings.
    pub wait: WaitConfig,
    /// Scratch space settings.
    pub scratch: ScratchConfig,
    /// 32-bit heap settings.
    pub heap32: Heap32Config,
}

/// Residency budget settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    /// Bytes the platform allows to be resident at once.
    pub budget_bytes: u64,
}

/// Fence polling settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// First sleep between polls once spinning gives up (microseconds).
    pub poll_interval_us: u64,
    /// Sleep cap for exponential backoff (microseconds).
    pub max_backoff_us: u64,
    /// Overall wait timeout; `None` waits forever.
    pub timeout_ms: Option<u64>,
}

/// Scratch controller settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScratchConfig {
    /// Concurrently executing compute units sharing a scratch backing.
    pub compute_unit_count: u64,
    /// Private (per-thread) scratch half of each slot.
    pub private_scratch_enabled: bool,
    /// Slot count with the private half disabled. Doubled when enabled.
    pub base_slot_count: u32,
}

/// Sub-4GB heap settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Heap32Config {
    /// First GPU virtual address of the heap.
    pub base: u64,
    /// Heap size in bytes. `base + size` must not exceed 4 GiB.
    pub size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            engine_count: 1,
            enable_allocation_reuse: true,
            enable_deferred_deleter: true,
            force_32bit_allocations: false,
            device_memory_bytes: 1 << 30,
            residency: ResidencyConfig::default(),
            wait: WaitConfig::default(),
            scratch: ScratchConfig::default(),
            heap32: Heap32Config::default(),
        }
    }
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self { budget_bytes: 256 << 20 }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 10,
            max_backoff_us: 1_000,
            timeout_ms: None,
        }
    }
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            compute_unit_count: 64,
            private_scratch_enabled: true,
            base_slot_count: 16,
        }
    }
}

impl Default for Heap32Config {
    fn default() -> Self {
        Self {
            base: 0x1000_0000,
            size: 0x8000_0000,
        }
    }
}

impl WaitConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Backoff cap as a duration.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_micros(self.max_backoff_us)
    }

    /// Timeout as a duration, if bounded.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl MemoryConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on syntax errors or invalid values.
    pub fn from_toml_str(text: &str) -> DriverResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| DriverError::InvalidConfig(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> DriverResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DriverError::InvalidConfig(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> DriverResult<()> {
        let invalid = |msg: &str| Err(DriverError::InvalidConfig(msg.to_string()));

        if self.engine_count == 0 || self.engine_count > MAX_ENGINES {
            return invalid("engine_count must be between 1 and MAX_ENGINES");
        }
        if self.device_memory_bytes == 0 || !is_aligned(self.device_memory_bytes, PAGE_SIZE) {
            return invalid("device_memory_bytes must be a non-zero page multiple");
        }
        if self.residency.budget_bytes == 0 {
            return invalid("residency.budget_bytes must be non-zero");
        }
        if self.wait.max_backoff_us < self.wait.poll_interval_us {
            return invalid("wait.max_backoff_us must be >= wait.poll_interval_us");
        }
        if self.scratch.compute_unit_count == 0 {
            return invalid("scratch.compute_unit_count must be non-zero");
        }
        if self.scratch.base_slot_count == 0 || !self.scratch.base_slot_count.is_power_of_two() {
            return invalid("scratch.base_slot_count must be a power of two");
        }
        if self.heap32.size == 0
            || !is_aligned(self.heap32.base, PAGE_SIZE)
            || !is_aligned(self.heap32.size, PAGE_SIZE)
        {
            return invalid("heap32 base and size must be non-zero page multiples");
        }
        if self.heap32.base.saturating_add(self.heap32.size) > 1 << 32 {
            return invalid("heap32 must end below 4 GiB");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MemoryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MemoryConfig::from_toml_str(
            r"
            engine_count = 2
            enable_allocation_reuse = false

            [wait]
            timeout_ms = 50
            ",
        )
        .unwrap();

        assert_eq!(config.engine_count, 2);
        assert!(!config.enable_allocation_reuse);
        assert_eq!(config.wait.timeout(), Some(Duration::from_millis(50)));
        assert_eq!(config.wait.poll_interval_us, 10);
        assert_eq!(config.scratch.base_slot_count, 16);
    }

    #[test]
    fn test_rejects_zero_engines() {
        let err = MemoryConfig::from_toml_str("engine_count = 0").unwrap_err();
        assert!(matches!(err, DriverError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_heap32_above_4gb() {
        let err = MemoryConfig::from_toml_str(
            r"
            [heap32]
            base = 0x80000000
            size = 0x90000000
            ",
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_syntax_error() {
        assert!(MemoryConfig::from_toml_str("engine_count = [").is_err());
    }

    #[test]
    fn test_shipped_config_parses() {
        let text = include_str!("../../../config/gfxmem.toml");
        let config = MemoryConfig::from_toml_str(text).unwrap();
        assert!(config.engine_count >= 1);
    }
}
