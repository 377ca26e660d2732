//! Streaming ZIP64 archive writer.
//!
//! Every entry is written with the `Stored` method (payload bytes equal source
//! bytes) and with the ZIP64 extra field forced on, so the same code path
//! handles a 5 KB project and a 50 GB one. Source files are copied in bounded
//! chunks; memory use does not grow with file size.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime as ChronoDateTime, Datelike, Local, Timelike};
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::model::{FileEntry, ScanResult, SoftWarning};
use crate::progress::{ProgressCallback, ProgressThrottle, ProgressTracker};

/// Default copy buffer size (8 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// What a write pass produced, complete or not.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    /// Bytes stored in archive entries
    pub bytes_written: u64,

    /// Entries stored in the archive
    pub files_written: u64,

    /// Indices into `ScanResult::entries` that were stored
    pub written: Vec<usize>,

    /// Entries skipped because their source could not be read
    pub warnings: Vec<SoftWarning>,

    pub duration: Duration,
}

/// A write pass that ended before finalizing a complete archive.
#[derive(Debug)]
pub struct WriteFailure {
    pub error: EngineError,

    /// The archive left on disk, if one was created
    pub partial_output: Option<PathBuf>,

    /// Progress made before the failure
    pub report: WriteReport,
}

/// Copies a scanned tree into a new archive.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    chunk_size: usize,
    throttle: ProgressThrottle,
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        ArchiveWriter {
            chunk_size: DEFAULT_CHUNK_SIZE,
            throttle: ProgressThrottle::default(),
        }
    }
}

/// Convert a file mtime to a ZIP (MS-DOS) timestamp in local time.
///
/// DOS time covers 1980..=2107; earlier times become the 1980 epoch and
/// later ones the last representable second.
pub fn zip_timestamp(modified: Option<SystemTime>) -> DateTime {
    let Some(modified) = modified else {
        return DateTime::default();
    };
    let local: ChronoDateTime<Local> = modified.into();
    let year = local.year();
    if year < 1980 {
        return DateTime::default();
    }
    if year > 2107 {
        return DateTime::from_date_and_time(2107, 12, 31, 23, 59, 58).unwrap_or_default();
    }
    DateTime::from_date_and_time(
        year as u16,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second().min(59) as u8,
    )
    .unwrap_or_default()
}

/// How a single entry copy ended.
enum EntryOutcome {
    Stored(u64),
    /// Bytes already reported to the tracker before the entry was dropped
    Skipped { warning: SoftWarning, counted: u64 },
}

impl ArchiveWriter {
    pub fn new(chunk_size: usize, throttle: ProgressThrottle) -> Self {
        ArchiveWriter {
            chunk_size: chunk_size.max(1),
            throttle,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Write every entry of `scan` into a new archive at `output`.
    ///
    /// The file is created with create-new semantics: an existing file is
    /// never replaced. On a fatal error or cancellation the partial archive
    /// is left in place and reported in `WriteFailure::partial_output`.
    pub fn write(
        &self,
        output: &Path,
        scan: &ScanResult,
        progress: Option<&dyn ProgressCallback>,
        cancel: &CancelToken,
    ) -> Result<WriteReport, WriteFailure> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(output)
            .map_err(|e| WriteFailure {
                error: if e.kind() == io::ErrorKind::AlreadyExists {
                    EngineError::DestinationExists {
                        path: output.to_path_buf(),
                    }
                } else {
                    EngineError::DestinationUnwritable {
                        path: output.to_path_buf(),
                        source: e,
                    }
                },
                partial_output: None,
                report: WriteReport::default(),
            })?;

        info!(archive = %output.display(), files = scan.total_files, bytes = scan.total_bytes, "writing archive");
        self.write_to(BufWriter::new(file), output, scan, progress, cancel)
            .map(|(report, _)| report)
            .map_err(|mut failure| {
                failure.partial_output = Some(output.to_path_buf());
                failure
            })
    }

    /// Stream the entries into any seekable sink. `label` names the sink in
    /// errors. Returns the report and the flushed sink.
    pub fn write_to<W: Write + Seek>(
        &self,
        sink: W,
        label: &Path,
        scan: &ScanResult,
        progress: Option<&dyn ProgressCallback>,
        cancel: &CancelToken,
    ) -> Result<(WriteReport, W), WriteFailure> {
        let mut zip = ZipWriter::new(sink);
        let mut tracker = ProgressTracker::new(scan.total_bytes, scan.total_files, self.throttle);
        let mut report = WriteReport::default();
        let mut buffer = vec![0u8; self.chunk_size];

        for (index, entry) in scan.entries.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(written = report.files_written, "cancellation requested, closing archive");
                report.duration = tracker.elapsed();
                let error = match finish(zip, label) {
                    Ok(_) => EngineError::Cancelled {
                        files_written: report.files_written,
                    },
                    Err(e) => e,
                };
                return Err(WriteFailure {
                    error,
                    partial_output: None,
                    report,
                });
            }

            match self.copy_entry(&mut zip, entry, &mut buffer, &mut tracker, progress) {
                Ok(EntryOutcome::Stored(bytes)) => {
                    report.bytes_written += bytes;
                    report.files_written += 1;
                    report.written.push(index);
                    debug!(entry = %entry.relative_path, bytes, "stored");
                    if let Some(callback) = progress {
                        callback.on_entry_written(index, entry);
                    }
                    if let Some(event) = tracker.add_file() {
                        if let Some(callback) = progress {
                            callback.on_progress(&event);
                        }
                    }
                }
                Ok(EntryOutcome::Skipped { warning, counted }) => {
                    tracker.discard_entry(entry.size, counted);
                    warn!(entry = %entry.relative_path, "{}", warning.message);
                    if let Some(callback) = progress {
                        callback.on_warning(&warning);
                    }
                    report.warnings.push(warning);
                }
                Err(error) => {
                    report.duration = tracker.elapsed();
                    // Best effort: the sink is already failing.
                    let _ = finish(zip, label);
                    return Err(WriteFailure {
                        error,
                        partial_output: None,
                        report,
                    });
                }
            }
        }

        let sink = match finish(zip, label) {
            Ok(sink) => sink,
            Err(error) => {
                report.duration = tracker.elapsed();
                return Err(WriteFailure {
                    error,
                    partial_output: None,
                    report,
                });
            }
        };

        let last = tracker.finish();
        if let Some(callback) = progress {
            callback.on_progress(&last);
        }
        report.duration = tracker.elapsed();
        Ok((report, sink))
    }

    /// Copy one source file into a new stored entry.
    ///
    /// Source-side failures are soft: the entry is either never started or
    /// aborted (removed from the archive). Sink-side failures are fatal.
    fn copy_entry<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        entry: &FileEntry,
        buffer: &mut [u8],
        tracker: &mut ProgressTracker,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<EntryOutcome, EngineError> {
        let label = || entry.source_path.clone();

        let mut source = match File::open(&entry.source_path) {
            Ok(file) => file,
            Err(e) => {
                return Ok(EntryOutcome::Skipped {
                    warning: SoftWarning::write(label(), format!("skipped, cannot open: {}", e)),
                    counted: 0,
                })
            }
        };

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(true)
            .last_modified_time(zip_timestamp(entry.modified));

        zip.start_file(entry.relative_path.as_str(), options)
            .map_err(|source| archive_error(label(), source))?;

        let mut copied = 0u64;
        loop {
            let n = match source.read(buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    zip.abort_file().map_err(|source| archive_error(label(), source))?;
                    return Ok(EntryOutcome::Skipped {
                        warning: SoftWarning::write(
                            label(),
                            format!("skipped, read failed after {} bytes: {}", copied, e),
                        ),
                        counted: copied,
                    });
                }
            };

            zip.write_all(&buffer[..n]).map_err(|source| EngineError::WriteFailed {
                path: label(),
                source,
            })?;
            copied += n as u64;

            if let Some(event) = tracker.add_bytes(n as u64) {
                if let Some(callback) = progress {
                    callback.on_progress(&event);
                }
            }
        }

        Ok(EntryOutcome::Stored(copied))
    }
}

fn archive_error(path: PathBuf, source: ZipError) -> EngineError {
    match source {
        ZipError::Io(source) => EngineError::WriteFailed { path, source },
        source => EngineError::Archive { path, source },
    }
}

/// Write the central directory and ZIP64 end records and flush the sink.
fn finish<W: Write + Seek>(zip: ZipWriter<W>, label: &Path) -> Result<W, EngineError> {
    let mut sink = zip
        .finish()
        .map_err(|source| archive_error(label.to_path_buf(), source))?;
    sink.flush().map_err(|source| EngineError::WriteFailed {
        path: label.to_path_buf(),
        source,
    })?;
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use std::sync::Mutex;

    fn fixture(dir: &Path, files: &[(&str, &[u8])]) -> ScanResult {
        let entries = files
            .iter()
            .map(|(rel, contents)| {
                let path = dir.join(rel);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, contents).unwrap();
                FileEntry {
                    source_path: path,
                    relative_path: rel.to_string(),
                    size: contents.len() as u64,
                    modified: None,
                }
            })
            .collect();
        ScanResult::from_entries(entries, Vec::new())
    }

    fn read_back(archive: &Path) -> Vec<(String, Vec<u8>)> {
        let mut zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| {
                let mut entry = zip.by_index(i).unwrap();
                assert_eq!(entry.compression(), CompressionMethod::Stored);
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (entry.name().to_string(), data)
            })
            .collect()
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<crate::progress::ProgressEvent>>,
        warnings: Mutex<Vec<SoftWarning>>,
    }

    impl ProgressCallback for Recorder {
        fn on_progress(&self, event: &crate::progress::ProgressEvent) {
            self.events.lock().unwrap().push(*event);
        }

        fn on_warning(&self, warning: &SoftWarning) {
            self.warnings.lock().unwrap().push(warning.clone());
        }
    }

    /// A sink that fails every write once `limit` bytes have been accepted.
    struct FailingSink {
        inner: Cursor<Vec<u8>>,
        limit: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.inner.get_ref().len() + buf.len() > self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingSink {
        fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("src");
        let scan = fixture(
            &src,
            &[("a.txt", b"hello"), ("dir/b.bin", &[0u8, 1, 2, 255]), ("dir/sub/c.txt", b"")],
        );
        let output = temp_dir.path().join("out.zip");

        let report = ArchiveWriter::default()
            .write(&output, &scan, None, &CancelToken::new())
            .expect("write should succeed");

        assert_eq!(report.files_written, 3);
        assert_eq!(report.bytes_written, 9);
        let entries = read_back(&output);
        assert_eq!(
            entries,
            vec![
                ("a.txt".to_string(), b"hello".to_vec()),
                ("dir/b.bin".to_string(), vec![0u8, 1, 2, 255]),
                ("dir/sub/c.txt".to_string(), Vec::new()),
            ]
        );
    }

    #[test]
    fn test_small_chunks_report_monotonic_progress() {
        let temp_dir = tempfile::tempdir().unwrap();
        let scan = fixture(
            temp_dir.path(),
            &[("one.txt", b"0123456789"), ("two.txt", b"abcdefghijklmnopqrstuvwxyz")],
        );
        let output = temp_dir.path().join("out.zip");
        let recorder = Recorder::default();

        let writer = ArchiveWriter::new(4, ProgressThrottle::unthrottled());
        let report = writer
            .write(&output, &scan, Some(&recorder), &CancelToken::new())
            .unwrap();

        let events = recorder.events.lock().unwrap();
        assert!(events.len() > 2, "expected per-chunk events, got {}", events.len());
        assert!(events.windows(2).all(|w| w[0].bytes_written <= w[1].bytes_written));
        let last = events.last().unwrap();
        assert_eq!(last.bytes_written, report.bytes_written);
        assert_eq!(last.files_written, 2);
        assert_eq!(events.iter().filter(|e| e.percent() >= 100.0).count(), 1);
    }

    #[test]
    fn test_existing_output_is_never_replaced() {
        let temp_dir = tempfile::tempdir().unwrap();
        let scan = fixture(&temp_dir.path().join("src"), &[("a.txt", b"a")]);
        let output = temp_dir.path().join("out.zip");
        fs::write(&output, b"precious").unwrap();

        let failure = ArchiveWriter::default()
            .write(&output, &scan, None, &CancelToken::new())
            .unwrap_err();

        assert!(matches!(failure.error, EngineError::DestinationExists { .. }));
        assert!(failure.partial_output.is_none());
        assert_eq!(fs::read(&output).unwrap(), b"precious");
    }

    #[test]
    fn test_missing_parent_is_destination_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let scan = fixture(&temp_dir.path().join("src"), &[("a.txt", b"a")]);
        let output = temp_dir.path().join("no/such/dir/out.zip");

        let failure = ArchiveWriter::default()
            .write(&output, &scan, None, &CancelToken::new())
            .unwrap_err();

        assert!(matches!(failure.error, EngineError::DestinationUnwritable { .. }));
    }

    #[test]
    fn test_vanished_file_is_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let scan = fixture(
            &temp_dir.path().join("src"),
            &[("a.txt", b"aaa"), ("gone.txt", b"gone"), ("z.txt", b"zz")],
        );
        fs::remove_file(temp_dir.path().join("src/gone.txt")).unwrap();
        let output = temp_dir.path().join("out.zip");
        let recorder = Recorder::default();

        let report = ArchiveWriter::default()
            .write(&output, &scan, Some(&recorder), &CancelToken::new())
            .expect("a vanished file must not abort the run");

        assert_eq!(report.files_written, 2);
        assert_eq!(report.bytes_written, 5);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(recorder.warnings.lock().unwrap().len(), 1);
        let names: Vec<_> = read_back(&output).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.txt", "z.txt"]);

        let events = recorder.events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.bytes_written, report.bytes_written);
        assert_eq!(last.files_written, report.files_written);
        assert_eq!(last.percent(), 100.0);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_failure_mid_entry_withdraws_its_bytes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut scan = fixture(&temp_dir.path().join("src"), &[("a.txt", b"aaaa"), ("z.txt", b"zz")]);
        // A directory opens fine on unix but every read fails.
        let dir = temp_dir.path().join("src/unreadable");
        fs::create_dir(&dir).unwrap();
        scan.entries.insert(
            1,
            FileEntry {
                source_path: dir,
                relative_path: "m.bin".to_string(),
                size: 100,
                modified: None,
            },
        );
        scan.total_files += 1;
        scan.total_bytes += 100;
        let output = temp_dir.path().join("out.zip");
        let recorder = Recorder::default();

        let report = ArchiveWriter::new(2, ProgressThrottle::unthrottled())
            .write(&output, &scan, Some(&recorder), &CancelToken::new())
            .expect("an unreadable entry must not abort the run");

        assert_eq!(report.files_written, 2);
        assert_eq!(report.bytes_written, 6);
        assert_eq!(report.warnings.len(), 1);
        let names: Vec<_> = read_back(&output).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.txt", "z.txt"]);

        let events = recorder.events.lock().unwrap();
        assert!(events.iter().all(|e| e.bytes_written <= report.bytes_written));
        let last = events.last().unwrap();
        assert_eq!(last.bytes_written, report.bytes_written);
        assert_eq!(last.total_files, 2);
        assert_eq!(last.percent(), 100.0);
    }

    #[test]
    fn test_cancel_before_first_entry_leaves_valid_empty_archive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let scan = fixture(&temp_dir.path().join("src"), &[("a.txt", b"a")]);
        let output = temp_dir.path().join("out.zip");
        let cancel = CancelToken::new();
        cancel.cancel();

        let failure = ArchiveWriter::default()
            .write(&output, &scan, None, &cancel)
            .unwrap_err();

        assert!(matches!(failure.error, EngineError::Cancelled { files_written: 0 }));
        assert_eq!(failure.partial_output.as_deref(), Some(output.as_path()));
        assert!(read_back(&output).is_empty());
    }

    #[test]
    fn test_sink_failure_is_fatal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let scan = fixture(temp_dir.path(), &[("big.bin", &[1u8; 4096]), ("next.txt", b"n")]);
        let sink = FailingSink {
            inner: Cursor::new(Vec::new()),
            limit: 1024,
        };

        let failure = ArchiveWriter::new(512, ProgressThrottle::default())
            .write_to(sink, Path::new("memory.zip"), &scan, None, &CancelToken::new())
            .err()
            .expect("write must fail once the sink is full");

        assert!(matches!(failure.error, EngineError::WriteFailed { .. }));
        assert_eq!(failure.report.files_written, 0);
    }

    #[test]
    fn test_entries_are_zip64() {
        let temp_dir = tempfile::tempdir().unwrap();
        let scan = fixture(temp_dir.path(), &[("a.txt", b"abc")]);

        let (_, sink) = ArchiveWriter::default()
            .write_to(Cursor::new(Vec::new()), Path::new("memory.zip"), &scan, None, &CancelToken::new())
            .unwrap();
        let bytes = sink.into_inner();

        // ZIP64 extended information extra field header id (0x0001).
        assert!(bytes.windows(4).any(|w| w == [0x01, 0x00, 0x10, 0x00]));
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn test_zip_timestamp_range() {
        let epoch = zip_timestamp(Some(std::time::UNIX_EPOCH));
        assert_eq!(epoch.year(), 1980);

        let mid_2021 = std::time::UNIX_EPOCH + Duration::from_secs(1_625_140_800); // 2021-07-01
        let stamp = zip_timestamp(Some(mid_2021));
        assert_eq!(stamp.year(), 2021);
        assert_eq!(stamp.month(), 7);

        assert_eq!(zip_timestamp(None).year(), 1980);
    }
}
