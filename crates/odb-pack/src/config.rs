use serde::{Deserialize, Serialize};

use crate::error::{PackError, PackResult};

/// Sizing for the shared window cache and the object-loading thresholds
/// that travel with it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowCacheConfig {
    /// Bytes per window. Must be a power of two and at least 4 KiB.
    pub window_size: usize,
    /// Upper bound on resident window bytes. Borrowed windows may push the
    /// cache past this momentarily.
    pub max_bytes: u64,
    /// Upper bound on simultaneously open pack file handles.
    pub max_open_files: usize,
    /// Objects whose inflated size exceeds this are only available as streams.
    pub stream_threshold: usize,
    /// Byte budget for reconstructed delta bases.
    pub delta_base_cache_limit: u64,
}

impl Default for WindowCacheConfig {
    fn default() -> Self {
        Self {
            window_size: 8 * 1024,              // 8 KiB
            max_bytes: 10 * 1024 * 1024,        // 10 MiB
            max_open_files: 128,
            stream_threshold: 50 * 1024 * 1024, // 50 MiB
            delta_base_cache_limit: 10 * 1024 * 1024,
        }
    }
}

impl WindowCacheConfig {
    pub const MIN_WINDOW_SIZE: usize = 4096;

    /// Check the configuration before it is installed.
    pub fn validate(&self) -> PackResult<()> {
        if self.window_size < Self::MIN_WINDOW_SIZE {
            return Err(PackError::InvalidConfig(format!(
                "window_size {} is below the {} byte minimum",
                self.window_size,
                Self::MIN_WINDOW_SIZE
            )));
        }
        if !self.window_size.is_power_of_two() {
            return Err(PackError::InvalidConfig(format!(
                "window_size {} is not a power of two",
                self.window_size
            )));
        }
        if self.max_open_files == 0 {
            return Err(PackError::InvalidConfig(
                "max_open_files must be at least 1".into(),
            ));
        }
        if self.max_bytes <= self.window_size as u64 {
            return Err(PackError::InvalidConfig(format!(
                "max_bytes {} must exceed the {} byte window size",
                self.max_bytes, self.window_size
            )));
        }
        if self.stream_threshold == 0 {
            return Err(PackError::InvalidConfig(
                "stream_threshold must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parse a `[window_cache]`-style TOML table. Missing keys take defaults.
    pub fn from_toml_str(input: &str) -> PackResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| PackError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Index format produced by the writer and indexer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexVersion {
    /// Pick the oldest format able to describe the pack.
    Auto,
    V1,
    #[default]
    V2,
}

/// Options for [`PackWriter`](crate::PackWriter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    pub index_version: IndexVersion,
    /// Copy stored deltas from existing packs when their base is also sent.
    pub reuse_deltas: bool,
    /// Copy stored whole objects from existing packs without re-deflating.
    pub reuse_objects: bool,
    /// Encode bases written earlier in the same pack as relative offsets.
    pub delta_base_as_offset: bool,
    /// Allow deltas against objects the receiver is assumed to have.
    pub thin: bool,
    /// Search for new deltas among the selected objects.
    pub delta_compress: bool,
    pub delta_search_window: usize,
    pub max_delta_depth: usize,
    /// zlib level, 0-9.
    pub compression_level: u32,
    /// Skip uninteresting roots that are not present in the database.
    pub ignore_missing_uninteresting: bool,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            index_version: IndexVersion::V2,
            reuse_deltas: true,
            reuse_objects: true,
            delta_base_as_offset: true,
            thin: false,
            delta_compress: true,
            delta_search_window: 10,
            max_delta_depth: 50,
            compression_level: 6,
            ignore_missing_uninteresting: false,
        }
    }
}

impl PackConfig {
    pub fn validate(&self) -> PackResult<()> {
        if self.compression_level > 9 {
            return Err(PackError::InvalidConfig(format!(
                "compression_level {} is outside 0-9",
                self.compression_level
            )));
        }
        if self.max_delta_depth > crate::MAX_DELTA_DEPTH {
            return Err(PackError::InvalidConfig(format!(
                "max_delta_depth {} exceeds the supported {}",
                self.max_delta_depth,
                crate::MAX_DELTA_DEPTH
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(input: &str) -> PackResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| PackError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Options for [`PackIndexer`](crate::PackIndexer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Accept REF_DELTA entries whose base lives outside the pack.
    pub allow_thin: bool,
    /// Append missing thin bases so the pack becomes self-contained.
    pub fix_thin: bool,
    /// Check the trailing SHA-1 against the pack body.
    pub verify_checksum: bool,
    pub max_delta_depth: usize,
    pub index_version: IndexVersion,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            allow_thin: false,
            fix_thin: false,
            verify_checksum: true,
            max_delta_depth: crate::MAX_DELTA_DEPTH,
            index_version: IndexVersion::V2,
        }
    }
}

impl IndexerConfig {
    /// Settings for receiving a thin pack into a local database.
    pub fn receive_thin() -> Self {
        Self {
            allow_thin: true,
            fix_thin: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        WindowCacheConfig::default().validate().unwrap();
        PackConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_window() {
        let config = WindowCacheConfig {
            window_size: 5000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PackError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_small_window() {
        let config = WindowCacheConfig {
            window_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_open_files() {
        let config = WindowCacheConfig {
            max_open_files: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_budget_not_exceeding_window() {
        let config = WindowCacheConfig {
            window_size: 8192,
            max_bytes: 8192,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = WindowCacheConfig {
            stream_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let config = WindowCacheConfig::from_toml_str(
            "window_size = 16384\nmax_open_files = 4\n",
        )
        .unwrap();
        assert_eq!(config.window_size, 16384);
        assert_eq!(config.max_open_files, 4);
        assert_eq!(config.stream_threshold, 50 * 1024 * 1024);
    }

    #[test]
    fn toml_validation_runs() {
        assert!(WindowCacheConfig::from_toml_str("window_size = 3000").is_err());
        assert!(WindowCacheConfig::from_toml_str("window_size = \"big\"").is_err());
    }

    #[test]
    fn pack_config_from_toml() {
        let config = PackConfig::from_toml_str(
            "thin = true\nindex_version = \"v1\"\ncompression_level = 1\n",
        )
        .unwrap();
        assert!(config.thin);
        assert_eq!(config.index_version, IndexVersion::V1);
        assert!(PackConfig::from_toml_str("compression_level = 12").is_err());
    }

    #[test]
    fn receive_thin_enables_fixing() {
        let config = IndexerConfig::receive_thin();
        assert!(config.allow_thin && config.fix_thin && config.verify_checksum);
    }
}
