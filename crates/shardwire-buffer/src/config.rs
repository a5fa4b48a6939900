//! Block pool geometry.
//!
//! ```text
//!  stride (4096)
//!  ├──────────── block_length (4032) ────────────┤├ guard (64) ┤
//! ```

use shardwire_core::env::env_get;
use shardwire_core::{ConfigError, ConfigResult, CACHE_LINE_SIZE};

/// Defaults for the pool geometry.
pub mod defaults {
    pub const BLOCK_STRIDE: usize = 4096;
    pub const BLOCK_GUARD: usize = 64;
    pub const BLOCKS_PER_SLAB: usize = 32;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Distance between the starts of adjacent blocks in a slab.
    pub block_stride: usize,

    /// Unused bytes at the end of each stride.
    pub block_guard: usize,

    /// Blocks carved from each slab.
    pub blocks_per_slab: usize,

    /// Largest `lease_with` request served from a slab. Bigger requests get
    /// a standalone allocation. `None` means `block_length()`.
    pub max_pooled_block_length: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_stride: defaults::BLOCK_STRIDE,
            block_guard: defaults::BLOCK_GUARD,
            blocks_per_slab: defaults::BLOCKS_PER_SLAB,
            max_pooled_block_length: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overridden by `SHARDWIRE_BLOCK_STRIDE`,
    /// `SHARDWIRE_BLOCK_GUARD` and `SHARDWIRE_BLOCKS_PER_SLAB`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            block_stride: env_get("SHARDWIRE_BLOCK_STRIDE", d.block_stride),
            block_guard: env_get("SHARDWIRE_BLOCK_GUARD", d.block_guard),
            blocks_per_slab: env_get("SHARDWIRE_BLOCKS_PER_SLAB", d.blocks_per_slab),
            max_pooled_block_length: d.max_pooled_block_length,
        }
    }

    pub fn block_stride(mut self, stride: usize) -> Self {
        self.block_stride = stride;
        self
    }

    pub fn block_guard(mut self, guard: usize) -> Self {
        self.block_guard = guard;
        self
    }

    pub fn blocks_per_slab(mut self, count: usize) -> Self {
        self.blocks_per_slab = count;
        self
    }

    pub fn max_pooled_block_length(mut self, len: usize) -> Self {
        self.max_pooled_block_length = Some(len);
        self
    }

    /// Usable bytes per block.
    #[inline]
    pub fn block_length(&self) -> usize {
        self.block_stride.saturating_sub(self.block_guard)
    }

    #[inline]
    pub fn slab_length(&self) -> usize {
        self.block_stride * self.blocks_per_slab
    }

    #[inline]
    pub fn pooled_limit(&self) -> usize {
        self.max_pooled_block_length
            .unwrap_or_else(|| self.block_length())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.block_stride == 0 || self.block_stride % CACHE_LINE_SIZE != 0 {
            return Err(ConfigError::invalid(
                "block_stride",
                format!("{} is not a non-zero multiple of {}", self.block_stride, CACHE_LINE_SIZE),
            ));
        }
        if self.block_guard >= self.block_stride {
            return Err(ConfigError::invalid(
                "block_guard",
                format!("{} leaves no usable bytes in a {} byte stride", self.block_guard, self.block_stride),
            ));
        }
        if self.blocks_per_slab == 0 {
            return Err(ConfigError::invalid("blocks_per_slab", "must be at least 1"));
        }
        if self.blocks_per_slab.checked_mul(self.block_stride).is_none() {
            return Err(ConfigError::invalid("blocks_per_slab", "slab length overflows"));
        }
        if let Some(max) = self.max_pooled_block_length {
            if max > self.block_length() {
                return Err(ConfigError::invalid(
                    "max_pooled_block_length",
                    format!("{} exceeds block length {}", max, self.block_length()),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let config = PoolConfig::default();
        assert_eq!(config.block_length(), 4032);
        assert_eq!(config.slab_length(), 128 * 1024);
        assert_eq!(config.pooled_limit(), 4032);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        assert!(PoolConfig::new().block_stride(1000).validate().is_err());
        assert!(PoolConfig::new().block_guard(4096).validate().is_err());
        assert!(PoolConfig::new().blocks_per_slab(0).validate().is_err());
        assert!(PoolConfig::new().max_pooled_block_length(5000).validate().is_err());
        assert!(PoolConfig::new().max_pooled_block_length(1024).validate().is_ok());
    }
}
