//! Progress reporting.
//!
//! This module defines the ProgressCallback trait, which decouples the backup
//! engine from any specific front end (CLI, GUI, scripts). Progress is
//! published as immutable `ProgressEvent` snapshots; consumers never touch
//! the writer's counters.
//!
//! `ChannelProgress` adapts the callback surface onto a `crossbeam-channel`
//! so a front end on another thread can consume a plain event stream.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::model::{BackupResult, FileEntry, JobState, SoftWarning};

/// A point-in-time snapshot of archive progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub files_written: u64,
    pub total_files: u64,
    pub elapsed: Duration,

    /// Bytes per second since the previous event
    pub throughput: f64,
}

impl ProgressEvent {
    /// Percent complete by bytes, clamped to 100. An empty total counts as done.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_written as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }

    /// Throughput in MiB/s
    pub fn mib_per_sec(&self) -> f64 {
        self.throughput / (1024.0 * 1024.0)
    }
}

/// Trait for receiving notifications from a backup run.
///
/// All methods are called synchronously on the worker executing the job, in
/// this order: state changes and warnings as they happen, progress events
/// while writing, then exactly one `on_job_completed`.
pub trait ProgressCallback: Send {
    /// Called on every job state transition.
    fn on_state_changed(&self, _state: JobState) {}

    /// Called with throttled progress snapshots while writing.
    fn on_progress(&self, event: &ProgressEvent);

    /// Called after an entry has been fully stored in the archive.
    fn on_entry_written(&self, _index: usize, _entry: &FileEntry) {}

    /// Called for every file dropped during scan or write.
    fn on_warning(&self, _warning: &SoftWarning) {}

    /// Called once with the terminal result of the run.
    fn on_job_completed(&self, _result: &BackupResult) {}
}

/// Limits how often progress events are emitted.
///
/// An event is published when either `interval` has passed or `min_bytes`
/// have been written since the previous event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressThrottle {
    pub interval: Duration,
    pub min_bytes: u64,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        ProgressThrottle {
            interval: Duration::from_millis(100),
            min_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ProgressThrottle {
    /// Emit on every opportunity.
    pub fn unthrottled() -> Self {
        ProgressThrottle {
            interval: Duration::ZERO,
            min_bytes: 0,
        }
    }
}

/// Running counters for one write pass. Owned by the writer only.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    throttle: ProgressThrottle,
    started: Instant,
    total_bytes: u64,
    total_files: u64,
    bytes_written: u64,
    files_written: u64,
    last_emit: Instant,
    bytes_at_last_emit: u64,
}

impl ProgressTracker {
    pub(crate) fn new(total_bytes: u64, total_files: u64, throttle: ProgressThrottle) -> Self {
        let now = Instant::now();
        ProgressTracker {
            throttle,
            started: now,
            total_bytes,
            total_files,
            bytes_written: 0,
            files_written: 0,
            last_emit: now,
            bytes_at_last_emit: 0,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record a copied chunk; returns an event if the throttle allows one.
    pub(crate) fn add_bytes(&mut self, n: u64) -> Option<ProgressEvent> {
        self.bytes_written += n;
        self.poll()
    }

    /// Record a finished entry; returns an event if the throttle allows one.
    pub(crate) fn add_file(&mut self) -> Option<ProgressEvent> {
        self.files_written += 1;
        self.poll()
    }

    /// Withdraw a skipped entry: its scanned size leaves the totals and the
    /// bytes already read from it leave the running count.
    pub(crate) fn discard_entry(&mut self, scanned_size: u64, counted: u64) {
        self.total_bytes = self.total_bytes.saturating_sub(scanned_size);
        self.total_files = self.total_files.saturating_sub(1);
        self.bytes_written = self.bytes_written.saturating_sub(counted);
        self.bytes_at_last_emit = self.bytes_at_last_emit.min(self.bytes_written);
    }

    /// The closing event of a successful pass. Always emitted.
    pub(crate) fn finish(&mut self) -> ProgressEvent {
        self.snapshot(Instant::now())
    }

    fn poll(&mut self) -> Option<ProgressEvent> {
        // The 100% point belongs to `finish` so it is reported exactly once.
        if self.bytes_written >= self.total_bytes {
            return None;
        }
        let now = Instant::now();
        let due = now.duration_since(self.last_emit) >= self.throttle.interval
            || self.bytes_written - self.bytes_at_last_emit >= self.throttle.min_bytes;
        if !due {
            return None;
        }
        Some(self.snapshot(now))
    }

    fn snapshot(&mut self, now: Instant) -> ProgressEvent {
        let window = now.duration_since(self.last_emit).as_secs_f64();
        let delta = self.bytes_written - self.bytes_at_last_emit;
        let elapsed = now.duration_since(self.started);
        let throughput = if window > 0.0 {
            delta as f64 / window
        } else if elapsed.as_secs_f64() > 0.0 {
            self.bytes_written as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        self.last_emit = now;
        self.bytes_at_last_emit = self.bytes_written;

        ProgressEvent {
            bytes_written: self.bytes_written,
            total_bytes: self.total_bytes,
            files_written: self.files_written,
            total_files: self.total_files,
            elapsed,
            throughput,
        }
    }
}

/// Everything a front end can observe about a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    StateChanged(JobState),
    Progress(ProgressEvent),
    Warning(SoftWarning),
    Finished(BackupResult),
}

/// A ProgressCallback that forwards every notification into a channel.
pub struct ChannelProgress {
    sender: Sender<JobEvent>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<JobEvent>) -> Self {
        ChannelProgress { sender }
    }
}

impl ProgressCallback for ChannelProgress {
    fn on_state_changed(&self, state: JobState) {
        let _ = self.sender.send(JobEvent::StateChanged(state));
    }

    fn on_progress(&self, event: &ProgressEvent) {
        let _ = self.sender.send(JobEvent::Progress(*event));
    }

    fn on_warning(&self, warning: &SoftWarning) {
        let _ = self.sender.send(JobEvent::Warning(warning.clone()));
    }

    fn on_job_completed(&self, result: &BackupResult) {
        let _ = self.sender.send(JobEvent::Finished(result.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_handles_empty_total() {
        let event = ProgressEvent {
            bytes_written: 0,
            total_bytes: 0,
            files_written: 1,
            total_files: 1,
            elapsed: Duration::ZERO,
            throughput: 0.0,
        };
        assert_eq!(event.percent(), 100.0);
    }

    #[test]
    fn test_percent_is_clamped() {
        let event = ProgressEvent {
            bytes_written: 150,
            total_bytes: 100,
            files_written: 1,
            total_files: 1,
            elapsed: Duration::from_secs(1),
            throughput: 150.0,
        };
        assert_eq!(event.percent(), 100.0);
    }

    #[test]
    fn test_unthrottled_tracker_reserves_final_event() {
        let mut tracker = ProgressTracker::new(10, 2, ProgressThrottle::unthrottled());

        let first = tracker.add_bytes(4).expect("unthrottled tracker should emit");
        assert_eq!(first.bytes_written, 4);
        assert!(tracker.add_file().is_some());

        // Reaching the total is left to `finish`.
        assert!(tracker.add_bytes(6).is_none());
        assert!(tracker.add_file().is_none());

        let last = tracker.finish();
        assert_eq!(last.bytes_written, 10);
        assert_eq!(last.files_written, 2);
        assert_eq!(last.percent(), 100.0);
    }

    #[test]
    fn test_discarded_entry_leaves_counters() {
        let mut tracker = ProgressTracker::new(30, 3, ProgressThrottle::unthrottled());
        tracker.add_bytes(10);
        tracker.add_file();

        // Second entry fails after 4 of its 10 bytes.
        tracker.add_bytes(4);
        tracker.discard_entry(10, 4);

        tracker.add_bytes(10);
        tracker.add_file();
        let last = tracker.finish();
        assert_eq!(last.bytes_written, 20);
        assert_eq!(last.total_bytes, 20);
        assert_eq!(last.files_written, 2);
        assert_eq!(last.total_files, 2);
        assert_eq!(last.percent(), 100.0);
    }

    #[test]
    fn test_throttle_suppresses_bursts() {
        let throttle = ProgressThrottle {
            interval: Duration::from_secs(3600),
            min_bytes: 100,
        };
        let mut tracker = ProgressTracker::new(1_000, 1, throttle);

        assert!(tracker.add_bytes(10).is_none());
        assert!(tracker.add_bytes(10).is_none());
        let event = tracker.add_bytes(80).expect("byte threshold reached");
        assert_eq!(event.bytes_written, 100);
        assert!(tracker.add_bytes(99).is_none());
    }

    #[test]
    fn test_channel_progress_forwards_events() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let callback = ChannelProgress::new(tx);

        callback.on_state_changed(JobState::Writing);
        callback.on_warning(&SoftWarning::write("/src/gone.txt", "file vanished"));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], JobEvent::StateChanged(JobState::Writing)));
        assert!(matches!(events[1], JobEvent::Warning(_)));
    }
}
