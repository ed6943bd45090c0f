//! Configuration management for keystone
//!
//! Provides presets for durable and testing deployments
//! and builder-style setters for custom configurations.

/// Compression codecs a LOB may be stored with. Codec implementations
/// live outside this crate; only the selection is decided here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// LZF block compression (fast)
    Lzf,
    /// Deflate (smaller output)
    Deflate,
}

impl CompressionAlgorithm {
    /// Stable tag stored next to compressed LOB data.
    pub fn tag(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Lzf => "LZF",
            CompressionAlgorithm::Deflate => "DEFLATE",
        }
    }
}

/// Keystone configuration, applied per database at open time
#[derive(Debug, Clone)]
pub struct Config {
    /// Open the database read-only; every write check fails
    pub read_only: bool,
    /// Initial value of OPTIMIZE_REUSE_RESULTS (result cache on/off)
    pub optimize_reuse_results: bool,
    /// Maximum number of cached statement results
    pub result_cache_capacity: usize,
    /// LOBs up to this many bytes are stored inline and get no ObjectId
    pub max_length_inplace_lob: usize,
    /// Compression for BLOB data (None = uncompressed)
    pub lob_compression: Option<CompressionAlgorithm>,
    /// Compression for CLOB data; falls back to `lob_compression` when None
    pub clob_compression: Option<CompressionAlgorithm>,
    /// Largest payload accepted by a checksummed block append
    pub max_block_size: usize,
    /// Power-failure countdown armed at open (0 = disabled)
    pub power_off_countdown: u64,
    /// durable_sync after every block append
    pub sync_writes: bool,
}

impl Config {
    /// Durable preset: every block synced, caching on.
    pub fn durable() -> Self {
        Self {
            read_only: false,
            optimize_reuse_results: true,
            result_cache_capacity: 1024,
            max_length_inplace_lob: 128,
            lob_compression: None,
            clob_compression: None,
            max_block_size: 16 * 1024 * 1024,
            power_off_countdown: 0,
            sync_writes: true,
        }
    }

    /// Testing preset: no fsync, small cache, small blocks.
    pub fn testing() -> Self {
        Self {
            read_only: false,
            optimize_reuse_results: true,
            result_cache_capacity: 64,
            max_length_inplace_lob: 128,
            lob_compression: None,
            clob_compression: None,
            max_block_size: 1024 * 1024,
            power_off_countdown: 0,
            sync_writes: false,
        }
    }

    /// Open read-only.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enable or disable result reuse.
    pub fn with_result_reuse(mut self, enabled: bool) -> Self {
        self.optimize_reuse_results = enabled;
        self
    }

    /// Arm the power-failure simulator at open.
    pub fn with_power_off_countdown(mut self, countdown: u64) -> Self {
        self.power_off_countdown = countdown;
        self
    }

    /// Select LOB compression for BLOB and CLOB data.
    pub fn with_lob_compression(mut self, algorithm: Option<CompressionAlgorithm>) -> Self {
        self.lob_compression = algorithm;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.result_cache_capacity == 0 {
            return Err("result_cache_capacity must be > 0".into());
        }
        if self.max_block_size == 0 || self.max_block_size > u32::MAX as usize {
            return Err("max_block_size must be in [1, 4GB)".into());
        }
        if self.max_length_inplace_lob > self.max_block_size {
            return Err("max_length_inplace_lob must not exceed max_block_size".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::durable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::durable().validate().is_ok());
        assert!(Config::testing().validate().is_ok());
    }

    #[test]
    fn test_zero_cache_rejected() {
        let mut config = Config::testing();
        config.result_cache_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inplace_lob_bounded_by_block() {
        let mut config = Config::testing();
        config.max_length_inplace_lob = config.max_block_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = Config::testing()
            .with_read_only(true)
            .with_result_reuse(false)
            .with_power_off_countdown(3)
            .with_lob_compression(Some(CompressionAlgorithm::Deflate));
        assert!(config.read_only);
        assert!(!config.optimize_reuse_results);
        assert_eq!(config.power_off_countdown, 3);
        assert_eq!(config.lob_compression, Some(CompressionAlgorithm::Deflate));
    }
}
