//! Tunables for the buffered write path and the chunk read cache.
//!
//! Loaded from YAML (`bucketfs.yml`), every field has a default so a partial
//! file is enough.

use crate::vfs::error::VfsError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MIB: u64 = 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u64 = 32 * MIB;
pub const DEFAULT_MAX_BLOCKS: u32 = 20;
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * MIB;
pub const DEFAULT_CACHE_CAPACITY: u64 = 1024 * MIB;
pub const DEFAULT_MAX_TRANSFERS: u32 = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Size of one in-memory block handed to the uploader.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Blocks a single file may have buffered or in flight before writes wait.
    #[serde(default = "default_max_blocks")]
    pub max_blocks: u32,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks: DEFAULT_MAX_BLOCKS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Download and cache granularity.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Budget shared by every cached object.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,
    /// Where chunks are persisted. Falls back to `dirs::cache_dir()/bucketfs`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub chunk_cache_enabled: bool,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_capacity_bytes: DEFAULT_CACHE_CAPACITY,
            cache_dir: None,
            chunk_cache_enabled: true,
        }
    }
}

impl ReadConfig {
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("bucketfs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub write: WriteConfig,
    #[serde(default)]
    pub read: ReadConfig,
    /// Size of the upload pool and, separately, of the download pool.
    #[serde(default = "default_max_transfers")]
    pub max_concurrent_transfers: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write: WriteConfig::default(),
            read: ReadConfig::default(),
            max_concurrent_transfers: DEFAULT_MAX_TRANSFERS,
        }
    }
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_max_blocks() -> u32 {
    DEFAULT_MAX_BLOCKS
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_cache_capacity() -> u64 {
    DEFAULT_CACHE_CAPACITY
}

fn default_max_transfers() -> u32 {
    DEFAULT_MAX_TRANSFERS
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, VfsError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| VfsError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Look for a config file in the usual places, or use the defaults.
    pub fn from_default_path() -> Result<Self, VfsError> {
        let possible_paths = ["bucketfs.yml", "bucketfs.yaml", "/etc/bucketfs/config.yml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), VfsError> {
        if self.write.block_size == 0 {
            return Err(VfsError::InvalidConfig("write.block_size must be > 0".into()));
        }
        if self.write.max_blocks == 0 {
            return Err(VfsError::InvalidConfig("write.max_blocks must be > 0".into()));
        }
        if self.read.chunk_size == 0 {
            return Err(VfsError::InvalidConfig("read.chunk_size must be > 0".into()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(VfsError::InvalidConfig(
                "max_concurrent_transfers must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn block_size(self, block_size: u64) -> Self {
        Self {
            write: WriteConfig {
                block_size,
                ..self.write
            },
            ..self
        }
    }

    pub fn max_blocks(self, max_blocks: u32) -> Self {
        Self {
            write: WriteConfig {
                max_blocks,
                ..self.write
            },
            ..self
        }
    }

    pub fn chunk_size(self, chunk_size: u64) -> Self {
        Self {
            read: ReadConfig {
                chunk_size,
                ..self.read
            },
            ..self
        }
    }

    pub fn cache_capacity(self, cache_capacity_bytes: u64) -> Self {
        Self {
            read: ReadConfig {
                cache_capacity_bytes,
                ..self.read
            },
            ..self
        }
    }

    pub fn cache_dir(self, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            read: ReadConfig {
                cache_dir: Some(cache_dir.into()),
                ..self.read
            },
            ..self
        }
    }

    pub fn chunk_cache_enabled(self, chunk_cache_enabled: bool) -> Self {
        Self {
            read: ReadConfig {
                chunk_cache_enabled,
                ..self.read
            },
            ..self
        }
    }

    pub fn max_concurrent_transfers(self, max_concurrent_transfers: u32) -> Self {
        Self {
            max_concurrent_transfers,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_transfers, DEFAULT_MAX_TRANSFERS);
        assert!(config.validate().is_ok());
        let empty: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(empty.max_concurrent_transfers, config.max_concurrent_transfers);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "write:\n  block_size: 1024\nread:\n  chunk_cache_enabled: false\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.write.block_size, 1024);
        assert_eq!(config.write.max_blocks, DEFAULT_MAX_BLOCKS);
        assert_eq!(config.read.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!config.read.chunk_cache_enabled);
        assert_eq!(config.max_concurrent_transfers, DEFAULT_MAX_TRANSFERS);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_rejects_zero_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucketfs.yml");
        std::fs::write(&path, "read:\n  chunk_size: 0\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, VfsError::InvalidConfig(_)));
    }

    #[test]
    fn test_builders() {
        let config = Config::default()
            .block_size(4096)
            .max_blocks(2)
            .chunk_size(8192)
            .cache_capacity(1 << 20)
            .max_concurrent_transfers(3);
        assert_eq!(config.write.block_size, 4096);
        assert_eq!(config.write.max_blocks, 2);
        assert_eq!(config.read.chunk_size, 8192);
        assert_eq!(config.read.cache_capacity_bytes, 1 << 20);
        assert_eq!(config.max_concurrent_transfers, 3);
    }
}
