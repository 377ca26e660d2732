//! Error types for the backup engine.
//!
//! The primary error type is `EngineError`, which represents job-level errors
//! that end a run. Per-file problems are not errors: they are recorded as
//! `SoftWarning`s and carried in the final result.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::JobState;

/// Errors that can occur at the job level.
///
/// Each variant maps onto exactly one `FailureKind` (see [`EngineError::kind`]),
/// except for the configuration and misuse variants which are raised before a
/// job starts.
///
/// Note: EngineError wraps io::Error and zip errors and is therefore not
/// serializable. `BackupFailure` carries the rendered message instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source exists but is not a directory
    #[error("Source is not a directory: {}", path.display())]
    SourceNotDirectory { path: PathBuf },

    /// Source directory cannot be read (permissions, I/O)
    #[error("Source directory cannot be read: {}", path.display())]
    SourceAccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The scan found nothing to archive
    #[error("No files to back up in {}", path.display())]
    NothingToBackUp { path: PathBuf },

    /// The output archive already exists
    #[error("Backup archive already exists: {}", path.display())]
    DestinationExists { path: PathBuf },

    /// The destination directory cannot be created or written to
    #[error("Destination is not writable: {}", path.display())]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing archive bytes failed (disk full, destination removed)
    #[error("Failed to write archive: {}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The archive container itself reported an error
    #[error("Archive error in {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// The caller asked the run to stop
    #[error("Backup cancelled after {files_written} files")]
    Cancelled { files_written: u64 },

    /// An exclusion pattern could not be compiled
    #[error("Invalid exclusion pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// A configuration file or value is invalid
    #[error("Invalid configuration{}: {message}", path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    InvalidConfig {
        path: Option<PathBuf>,
        message: String,
    },

    /// `run` was called on a job that already left `Idle`
    #[error("Job already started (state: {state:?})")]
    JobAlreadyStarted { state: JobState },
}

/// The terminal failure categories of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Root missing or unreadable; no archive attempted
    Scan,
    /// Output path collision or unwritable destination; no archive attempted
    Destination,
    /// Destination failed mid-run; partial archive preserved
    WriteFatal,
    /// Caller-requested stop; partial archive preserved
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Scan => write!(f, "scan error"),
            FailureKind::Destination => write!(f, "destination error"),
            FailureKind::WriteFatal => write!(f, "write error"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl EngineError {
    /// The failure category this error ends a run with.
    ///
    /// Configuration and misuse errors never reach a running job; they are
    /// reported as destination-independent scan failures if they ever do.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SourceNotFound { .. }
            | Self::SourceNotDirectory { .. }
            | Self::SourceAccessDenied { .. }
            | Self::NothingToBackUp { .. }
            | Self::InvalidPattern { .. }
            | Self::InvalidConfig { .. }
            | Self::JobAlreadyStarted { .. } => FailureKind::Scan,
            Self::DestinationExists { .. } | Self::DestinationUnwritable { .. } => {
                FailureKind::Destination
            }
            Self::WriteFailed { .. } | Self::Archive { .. } => FailureKind::WriteFatal,
            Self::Cancelled { .. } => FailureKind::Cancelled,
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SourceAccessDenied { source, .. }
            | Self::DestinationUnwritable { source, .. }
            | Self::WriteFailed { source, .. } => source.raw_os_error(),
            Self::Archive {
                source: zip::result::ZipError::Io(source),
                ..
            } => source.raw_os_error(),
            _ => None,
        }
    }
}
