//! Job orchestration module.
//!
//! A `BackupJob` owns one run from configuration to terminal result:
//! - Naming the output archive from the root and the start time
//! - Checking the destination before any scanning happens
//! - Scanning the source tree
//! - Streaming the archive and forwarding progress
//! - Optionally verifying the finished archive
//!
//! `BackupJob::spawn` runs the same sequence on a worker thread and exposes
//! it as a `JobEvent` channel.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Local};
use crossbeam_channel::Receiver;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::WriteFailure;
use crate::cancel::CancelToken;
use crate::checksums::verify_archive;
use crate::config::BackupOptions;
use crate::error::EngineError;
use crate::filter::PathFilter;
use crate::model::{BackupFailure, BackupResult, BackupSummary, JobState, SoftWarning};
use crate::progress::{ChannelProgress, JobEvent, ProgressCallback};
use crate::scanner;

/// Archive file name for a root and a start time: `<basename>-YYYYMMDD-HHMMSS.zip`.
///
/// Roots without a usable final component (`.`, `/`) are resolved first;
/// if that fails too the name falls back to `backup`.
pub fn archive_file_name(root: &Path, time: DateTime<Local>) -> String {
    let base = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .or_else(|| {
            fs::canonicalize(root)
                .ok()
                .and_then(|p| p.file_name().map(|name| name.to_string_lossy().into_owned()))
        })
        .unwrap_or_else(|| "backup".to_string());
    format!("{}-{}.zip", base, time.format("%Y%m%d-%H%M%S"))
}

/// The directory that holds the root, where archives go by default.
fn default_destination(root: &Path) -> PathBuf {
    match root.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => fs::canonicalize(root)
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}

/// A single backup run.
#[derive(Debug)]
pub struct BackupJob {
    id: Uuid,
    source_path: PathBuf,
    destination_dir: PathBuf,
    options: BackupOptions,
    filter: PathFilter,
    state: JobState,
    created_at: DateTime<Local>,
    start_time: Option<DateTime<Local>>,
    output_path: Option<PathBuf>,
}

impl BackupJob {
    /// Configure a job.
    ///
    /// `destination` defaults to the parent of `source`. Nothing on disk is
    /// touched here; exclusion patterns are compiled so that a bad pattern is
    /// reported before the run starts.
    ///
    /// # Errors
    /// Returns `InvalidPattern` or `InvalidConfig` for unusable options.
    pub fn new<P: AsRef<Path>>(
        source: P,
        destination: Option<PathBuf>,
        options: BackupOptions,
    ) -> Result<Self, EngineError> {
        options.validate()?;
        let filter = options.path_filter()?;
        let source_path = source.as_ref().to_path_buf();
        let destination_dir = destination.unwrap_or_else(|| default_destination(&source_path));

        Ok(BackupJob {
            id: Uuid::new_v4(),
            source_path,
            destination_dir,
            options,
            filter,
            state: JobState::Idle,
            created_at: Local::now(),
            start_time: None,
            output_path: None,
        })
    }

    /// Pin the start time used for the archive name instead of the clock.
    pub fn with_start_time(mut self, time: DateTime<Local>) -> Self {
        self.start_time = Some(time);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn destination_dir(&self) -> &Path {
        &self.destination_dir
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    /// The archive path, known once the run has started.
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Run the job to completion on the calling thread.
    ///
    /// Every outcome of the run itself, including cancellation, is reported
    /// as a `BackupResult`; `progress.on_job_completed` is called exactly once
    /// with the same value.
    ///
    /// # Errors
    /// Returns `JobAlreadyStarted` if the job has left the Idle state.
    pub fn run(
        &mut self,
        progress: Option<&dyn ProgressCallback>,
        cancel: &CancelToken,
    ) -> Result<BackupResult, EngineError> {
        if self.state != JobState::Idle {
            return Err(EngineError::JobAlreadyStarted { state: self.state });
        }

        let clock = Instant::now();
        let started_at = *self.start_time.get_or_insert_with(Local::now);
        let output = self
            .destination_dir
            .join(archive_file_name(&self.source_path, started_at));
        self.output_path = Some(output.clone());
        info!(job = %self.id, source = %self.source_path.display(), archive = %output.display(), "starting backup");

        if let Err(error) = prepare_destination(&self.destination_dir, &output) {
            return Ok(self.fail(error, None, Vec::new(), progress));
        }

        self.transition(JobState::Scanning, progress);
        let scan = match scanner::scan(&self.source_path, &self.filter) {
            Ok(scan) => scan,
            Err(error) => return Ok(self.fail(error, None, Vec::new(), progress)),
        };
        if let Some(callback) = progress {
            for warning in &scan.warnings {
                callback.on_warning(warning);
            }
        }
        let mut warnings = scan.warnings.clone();

        if cancel.is_cancelled() {
            let error = EngineError::Cancelled { files_written: 0 };
            return Ok(self.fail(error, None, warnings, progress));
        }

        self.transition(JobState::Writing, progress);
        let writer = self.options.archive_writer();
        let report = match writer.write(&output, &scan, progress, cancel) {
            Ok(report) => report,
            Err(WriteFailure {
                error,
                partial_output,
                report,
            }) => {
                warnings.extend(report.warnings);
                return Ok(self.fail(error, partial_output, warnings, progress));
            }
        };
        warnings.extend(report.warnings.iter().cloned());

        let verification = self.options.verify.and_then(|algorithm| {
            let written = report.written.iter().map(|&i| &scan.entries[i]);
            match verify_archive(&output, written, algorithm) {
                Ok(verification) => {
                    if !verification.passed() {
                        warn!(
                            mismatched = verification.mismatched.len(),
                            missing = verification.missing.len(),
                            "archive verification failed"
                        );
                    }
                    Some(verification)
                }
                Err(e) => {
                    let warning = SoftWarning::write(&output, format!("verification skipped: {}", e));
                    warn!("{}", warning);
                    warnings.push(warning);
                    None
                }
            }
        });

        let summary = BackupSummary {
            job_id: self.id,
            archive_path: output,
            total_bytes: report.bytes_written,
            total_files: report.files_written,
            started_at,
            duration: clock.elapsed(),
            warnings,
            verification,
        };
        info!(
            job = %self.id,
            files = summary.total_files,
            bytes = summary.total_bytes,
            warnings = summary.warnings.len(),
            "backup completed"
        );
        Ok(self.conclude(JobState::Completed, BackupResult::Completed(summary), progress))
    }

    /// Run the job on a dedicated worker thread.
    ///
    /// Everything the run reports is delivered through the returned handle's
    /// event channel; the last event is always `JobEvent::Finished`.
    pub fn spawn(mut self, cancel: CancelToken) -> JobHandle {
        let (sender, events) = crossbeam_channel::unbounded();
        let id = self.id;
        let worker_cancel = cancel.clone();
        let worker = thread::spawn(move || {
            let callback = ChannelProgress::new(sender);
            self.run(Some(&callback), &worker_cancel)
        });

        JobHandle {
            id,
            events,
            cancel,
            worker,
        }
    }

    fn transition(&mut self, state: JobState, progress: Option<&dyn ProgressCallback>) {
        info!(job = %self.id, from = %self.state, to = %state, "state changed");
        self.state = state;
        if let Some(callback) = progress {
            callback.on_state_changed(state);
        }
    }

    fn fail(
        &mut self,
        error: EngineError,
        partial_output: Option<PathBuf>,
        warnings: Vec<SoftWarning>,
        progress: Option<&dyn ProgressCallback>,
    ) -> BackupResult {
        warn!(job = %self.id, kind = %error.kind(), "backup failed: {}", error);
        let failure = BackupFailure {
            job_id: self.id,
            kind: error.kind(),
            message: error.to_string(),
            partial_output,
            warnings,
        };
        self.conclude(JobState::Failed, BackupResult::Failed(failure), progress)
    }

    fn conclude(
        &mut self,
        state: JobState,
        result: BackupResult,
        progress: Option<&dyn ProgressCallback>,
    ) -> BackupResult {
        self.transition(state, progress);
        if let Some(callback) = progress {
            callback.on_job_completed(&result);
        }
        result
    }
}

/// Create the destination directory if needed, check that files can be
/// created in it, and refuse an existing archive.
fn prepare_destination(dir: &Path, output: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(dir).map_err(|source| EngineError::DestinationUnwritable {
        path: dir.to_path_buf(),
        source,
    })?;
    if !dir.is_dir() {
        return Err(EngineError::DestinationUnwritable {
            path: dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "destination is not a directory"),
        });
    }
    // Removed again on drop.
    tempfile::Builder::new()
        .prefix(".project-backup-")
        .tempfile_in(dir)
        .map_err(|source| EngineError::DestinationUnwritable {
            path: dir.to_path_buf(),
            source,
        })?;
    match fs::symlink_metadata(output) {
        Ok(_) => Err(EngineError::DestinationExists {
            path: output.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(EngineError::DestinationUnwritable {
            path: output.to_path_buf(),
            source,
        }),
    }
}

/// A job running on a worker thread.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    events: Receiver<JobEvent>,
    cancel: CancelToken,
    worker: JoinHandle<Result<BackupResult, EngineError>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The event stream. It disconnects once the worker has finished.
    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    /// Request cancellation. The worker stops at the next entry boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the worker and return its result.
    pub fn join(self) -> Result<BackupResult, EngineError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
