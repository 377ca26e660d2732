//! Core data model for backup runs.
//!
//! This module defines the values that flow between the components:
//! - FileEntry / ScanResult: what the scanner found
//! - SoftWarning: a recoverable per-file problem
//! - JobState: the lifecycle of a BackupJob
//! - BackupResult: the single terminal value of a run

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::VerificationReport;
use crate::error::FailureKind;

/// A single regular file selected for the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Full path used to open the file
    pub source_path: PathBuf,

    /// Path relative to the backup root, always `/`-separated
    pub relative_path: String,

    /// File size in bytes at scan time
    pub size: u64,

    /// Modification time at scan time (None if the platform can't report it)
    pub modified: Option<SystemTime>,
}

/// The output of a tree scan, sorted by relative path.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub entries: Vec<FileEntry>,

    /// Sum of all entry sizes
    pub total_bytes: u64,

    /// Number of entries
    pub total_files: u64,

    /// Files dropped during the scan
    pub warnings: Vec<SoftWarning>,
}

impl ScanResult {
    /// Build a result from unsorted entries, sorting them and computing totals.
    pub fn from_entries(mut entries: Vec<FileEntry>, warnings: Vec<SoftWarning>) -> Self {
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let total_bytes = entries.iter().map(|e| e.size).sum();
        let total_files = entries.len() as u64;
        ScanResult {
            entries,
            total_bytes,
            total_files,
            warnings,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a soft warning was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningPhase {
    Scan,
    Write,
}

/// A recoverable per-file problem. Never aborts a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftWarning {
    pub phase: WarningPhase,
    pub path: PathBuf,
    pub message: String,
}

impl SoftWarning {
    pub fn scan(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SoftWarning {
            phase: WarningPhase::Scan,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SoftWarning {
            phase: WarningPhase::Write,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SoftWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// The state of a backup job.
///
/// `Idle -> Scanning -> Writing -> {Completed | Failed}`. Both terminal states
/// are final and no state is entered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Configured, not yet started
    Idle,
    /// Enumerating the source tree
    Scanning,
    /// Streaming entries into the archive
    Writing,
    /// Archive finalized
    Completed,
    /// Run ended early (see `FailureKind`)
    Failed,
}

impl JobState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Idle => write!(f, "Idle"),
            JobState::Scanning => write!(f, "Scanning"),
            JobState::Writing => write!(f, "Writing"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Failed => write!(f, "Failed"),
        }
    }
}

/// Details of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSummary {
    pub job_id: Uuid,
    pub archive_path: PathBuf,

    /// Bytes stored in the archive (may be below the scan total if files were skipped)
    pub total_bytes: u64,

    /// Entries stored in the archive
    pub total_files: u64,

    pub started_at: DateTime<Local>,
    pub duration: Duration,
    pub warnings: Vec<SoftWarning>,

    /// Present when post-write verification was requested
    pub verification: Option<VerificationReport>,
}

/// Details of a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFailure {
    pub job_id: Uuid,
    pub kind: FailureKind,
    pub message: String,

    /// Archive left on disk by a run that stopped while writing
    pub partial_output: Option<PathBuf>,

    pub warnings: Vec<SoftWarning>,
}

/// The terminal value of a backup run. Produced exactly once per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackupResult {
    Completed(BackupSummary),
    Failed(BackupFailure),
}

impl BackupResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, BackupResult::Completed(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            BackupResult::Completed(_) => None,
            BackupResult::Failed(failure) => Some(failure.kind),
        }
    }

    pub fn warnings(&self) -> &[SoftWarning] {
        match self {
            BackupResult::Completed(summary) => &summary.warnings,
            BackupResult::Failed(failure) => &failure.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rel: &str, size: u64) -> FileEntry {
        FileEntry {
            source_path: PathBuf::from("/src").join(rel),
            relative_path: rel.to_string(),
            size,
            modified: None,
        }
    }

    #[test]
    fn test_scan_result_sorts_and_totals() {
        let result = ScanResult::from_entries(
            vec![entry("src/main.rs", 10), entry("Cargo.toml", 3), entry("src.txt", 1)],
            Vec::new(),
        );

        let order: Vec<_> = result.entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(order, vec!["Cargo.toml", "src.txt", "src/main.rs"]);
        assert_eq!(result.total_bytes, 14);
        assert_eq!(result.total_files, 3);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Idle.is_terminal());
        assert!(!JobState::Writing.is_terminal());
    }
}
