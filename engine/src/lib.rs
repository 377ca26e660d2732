//! # project-backup engine
//!
//! A headless engine that snapshots a project directory into a timestamped,
//! uncompressed ZIP64 archive. Designed as the foundation for multiple front
//! ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! The engine provides:
//! - Deterministic tree scanning with name/glob exclusions
//! - Streaming store-mode ZIP64 writing with bounded memory
//! - Throttled progress reporting via callbacks or an event channel
//! - Cooperative cancellation that leaves a valid partial archive
//! - Optional post-write verification with CRC32, SHA-256 or BLAKE3
//!
//! ## Basic Usage
//!
//! ```no_run
//! use backup_engine::{BackupJob, BackupOptions, BackupResult, CancelToken};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut job = BackupJob::new("/home/me/projects/app", None, BackupOptions::default())?;
//!
//! match job.run(None, &CancelToken::new())? {
//!     BackupResult::Completed(summary) => {
//!         println!("{} files -> {}", summary.total_files, summary.archive_path.display());
//!     }
//!     BackupResult::Failed(failure) => {
//!         eprintln!("{}: {}", failure.kind, failure.message);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (FileEntry, ScanResult, BackupResult)
//! - **error**: Error types and failure categories
//! - **filter**: Exclusion rules
//! - **scanner**: Source tree enumeration
//! - **archive**: ZIP64 archive writer
//! - **job**: Job orchestration (run, spawn)
//! - **progress**: Progress callback trait and event channel
//! - **cancel**: Cancellation token
//! - **config**: Run options, loadable from TOML
//! - **checksums**: Checksum computation and archive verification

pub mod archive;
pub mod cancel;
pub mod checksums;
pub mod config;
pub mod error;
pub mod filter;
pub mod job;
pub mod model;
pub mod progress;
pub mod scanner;

// Re-export main types and functions
pub use archive::{ArchiveWriter, WriteFailure, WriteReport, DEFAULT_CHUNK_SIZE};
pub use cancel::CancelToken;
pub use checksums::{
    compute_file_checksum, verify_archive, ChecksumAlgorithm, ChecksumValue, VerificationReport,
};
pub use config::BackupOptions;
pub use error::{EngineError, FailureKind};
pub use filter::{ExclusionRule, PathFilter, DEFAULT_EXCLUDES};
pub use job::{archive_file_name, BackupJob, JobHandle};
pub use model::{
    BackupFailure, BackupResult, BackupSummary, FileEntry, JobState, ScanResult, SoftWarning,
    WarningPhase,
};
pub use progress::{ChannelProgress, JobEvent, ProgressCallback, ProgressEvent, ProgressThrottle};
pub use scanner::scan;
