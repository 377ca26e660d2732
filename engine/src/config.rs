//! Run configuration.
//!
//! `BackupOptions` holds everything a front end can tune. It deserializes
//! from TOML with every field optional:
//!
//! ```toml
//! exclude = ["*.log", "docs/generated"]
//! default_excludes = [".git", "node_modules", "target"]
//! case_insensitive = false
//! chunk_size = 8388608
//! progress_interval_ms = 100
//! verify = "sha256"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveWriter, DEFAULT_CHUNK_SIZE};
use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;
use crate::filter::{PathFilter, DEFAULT_EXCLUDES};
use crate::progress::ProgressThrottle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupOptions {
    /// Extra names or globs excluded on top of the defaults (files and directories)
    pub exclude: Vec<String>,

    /// Directory names excluded at any depth
    pub default_excludes: Vec<String>,

    /// Set to false to drop `default_excludes` entirely
    pub use_default_excludes: bool,

    pub case_insensitive: bool,

    /// Copy buffer size in bytes
    pub chunk_size: usize,

    /// Minimum time between progress events
    pub progress_interval_ms: u64,

    /// Bytes after which a progress event is due regardless of time
    pub progress_min_bytes: u64,

    /// Re-read the archive after writing and compare with the sources
    pub verify: Option<ChecksumAlgorithm>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        let throttle = ProgressThrottle::default();
        BackupOptions {
            exclude: Vec::new(),
            default_excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            use_default_excludes: true,
            case_insensitive: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval_ms: throttle.interval.as_millis() as u64,
            progress_min_bytes: throttle.min_bytes,
            verify: None,
        }
    }
}

impl BackupOptions {
    /// Load options from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path).map_err(|e| EngineError::InvalidConfig {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })?;
        let options: BackupOptions = toml::from_str(&text).map_err(|e| EngineError::InvalidConfig {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::InvalidConfig {
                path: None,
                message: "chunk_size must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Compile the exclusion rules: defaults first, then caller patterns.
    pub fn path_filter(&self) -> Result<PathFilter, EngineError> {
        let defaults: &[String] = if self.use_default_excludes {
            &self.default_excludes
        } else {
            &[]
        };
        PathFilter::build(defaults, &self.exclude, self.case_insensitive)
    }

    pub fn throttle(&self) -> ProgressThrottle {
        ProgressThrottle {
            interval: Duration::from_millis(self.progress_interval_ms),
            min_bytes: self.progress_min_bytes,
        }
    }

    pub fn archive_writer(&self) -> ArchiveWriter {
        ArchiveWriter::new(self.chunk_size, self.throttle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_standard_excludes() {
        let options = BackupOptions::default();
        let filter = options.path_filter().unwrap();

        assert!(filter.should_exclude("node_modules", true));
        assert!(filter.should_exclude("venv", true));
        assert_eq!(options.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_from_file_merges_with_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("backup.toml");
        fs::write(
            &path,
            "exclude = [\"*.log\"]\nprogress_interval_ms = 250\nverify = \"blake3\"\n",
        )
        .unwrap();

        let options = BackupOptions::from_file(&path).unwrap();

        assert_eq!(options.exclude, vec!["*.log".to_string()]);
        assert_eq!(options.progress_interval_ms, 250);
        assert_eq!(options.verify, Some(ChecksumAlgorithm::Blake3));
        assert!(options.use_default_excludes);
        assert_eq!(options.default_excludes.len(), DEFAULT_EXCLUDES.len());
    }

    #[test]
    fn test_disabling_defaults() {
        let options = BackupOptions {
            use_default_excludes: false,
            exclude: vec!["target".to_string()],
            ..BackupOptions::default()
        };
        let filter = options.path_filter().unwrap();

        assert!(!filter.should_exclude(".git", true));
        assert!(filter.should_exclude("target", true));
    }

    #[test]
    fn test_rejects_unknown_keys_and_zero_chunk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("backup.toml");

        fs::write(&path, "compression = \"deflate\"\n").unwrap();
        assert!(matches!(
            BackupOptions::from_file(&path),
            Err(EngineError::InvalidConfig { .. })
        ));

        fs::write(&path, "chunk_size = 0\n").unwrap();
        assert!(matches!(
            BackupOptions::from_file(&path),
            Err(EngineError::InvalidConfig { .. })
        ));
    }
}
