use std::path::PathBuf;

use crate::compress::Compression;
use crate::error::{Error, Result};

/// Default delta block size (4 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: usize = 64;
/// Largest accepted block size (64 KiB).
pub const MAX_BLOCK_SIZE: usize = 65536;
/// Default rolling hash window.
pub const DEFAULT_WINDOW_SIZE: usize = 64;
/// Default memory ceiling for a single delta run (100 MiB).
pub const DEFAULT_MAX_MEMORY: u64 = 100 * 1024 * 1024;

/// Tuning for delta generation. Validated once at construction; the engine
/// never revisits these mid-stream.
#[derive(Debug, Clone)]
pub struct DeltaConfig {
    /// Source block size; the unit of COPY.
    pub block_size: usize,
    /// Rolling hash window width.
    pub window_size: usize,
    /// Populate and confirm CRC32 per block.
    pub enable_crc32: bool,
    /// Populate whole-file SHA-256 digests.
    pub enable_sha256: bool,
    /// Ceiling on buffered unmatched data plus accumulated literals.
    pub max_memory: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            enable_crc32: true,
            enable_sha256: true,
            max_memory: DEFAULT_MAX_MEMORY,
        }
    }
}

impl DeltaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "block size {} outside {}..={}",
                    self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
                ),
            });
        }
        if self.window_size < 8 || self.window_size > self.block_size {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "window size {} outside 8..=block size {}",
                    self.window_size, self.block_size
                ),
            });
        }
        if self.max_memory < 1024 * 1024 {
            return Err(Error::InvalidConfig {
                reason: format!("max memory {} below 1 MiB floor", self.max_memory),
            });
        }
        Ok(())
    }
}

/// Applier behavior knobs.
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Bounded buffer for COPY streaming.
    pub buffer_size: usize,
    /// Verify the reconstructed target digest before publishing.
    pub verify: bool,
    /// Snapshot an existing target before replacing it.
    pub backup: bool,
    /// Where backups land; defaults to `.hexpatch_backups` next to the target.
    pub backup_dir: Option<PathBuf>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            verify: true,
            backup: false,
            backup_dir: None,
        }
    }
}

impl ApplyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "apply buffer size must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Directory driver configuration.
#[derive(Debug, Clone)]
pub struct TreeDiffConfig {
    /// Per-file delta tuning.
    pub delta: DeltaConfig,
    /// Literal-blob codec for embedded patches.
    pub compression: Compression,
    /// Patterns matched against forward-slash relative paths.
    pub ignore_patterns: Vec<String>,
    /// Skip entries whose basename starts with ".".
    pub ignore_hidden: bool,
    /// Descend through symlinks instead of skipping them.
    pub follow_symlinks: bool,
    /// Worker threads for per-file delta generation.
    pub worker_count: usize,
}

impl Default for TreeDiffConfig {
    fn default() -> Self {
        Self {
            delta: DeltaConfig::default(),
            compression: Compression::Gzip,
            ignore_patterns: vec![
                ".git".into(),
                "__pycache__".into(),
                "node_modules".into(),
                ".DS_Store".into(),
                "*.swp".into(),
            ],
            ignore_hidden: false,
            follow_symlinks: false,
            worker_count: 4,
        }
    }
}

impl TreeDiffConfig {
    pub fn validate(&self) -> Result<()> {
        self.delta.validate()?;
        if self.worker_count < 1 || self.worker_count > 32 {
            return Err(Error::InvalidConfig {
                reason: format!("worker count {} outside 1..=32", self.worker_count),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delta_config_is_valid() {
        assert!(DeltaConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_block_size() {
        let cfg = DeltaConfig {
            block_size: 16,
            ..DeltaConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_window_wider_than_block() {
        let cfg = DeltaConfig {
            block_size: 64,
            window_size: 128,
            ..DeltaConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = TreeDiffConfig {
            worker_count: 0,
            ..TreeDiffConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
