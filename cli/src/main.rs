//! project-backup - Command-line front end for the backup engine.
//!
//! Snapshots a project directory into a timestamped ZIP64 archive, printing
//! progress to stdout (or an NDJSON event stream with `--json`) and errors to
//! stderr.

mod logging;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use backup_engine::{
    BackupJob, BackupOptions, BackupResult, CancelToken, ChecksumAlgorithm, FailureKind,
    JobEvent, JobState, ProgressCallback, ProgressEvent, SoftWarning,
};
use clap::Parser;
use humansize::{format_size, BINARY};
use tracing::warn;

/// project-backup - Timestamped store-mode archives of project trees
#[derive(Parser, Debug)]
#[command(name = "project-backup")]
#[command(version)]
#[command(about = "Archive a project directory into a timestamped ZIP64 file")]
struct Args {
    /// Project directory to back up
    #[arg(short, long, value_name = "PATH")]
    source: PathBuf,

    /// Directory for the archive (default: the source's parent)
    #[arg(short, long, value_name = "PATH")]
    dest: Option<PathBuf>,

    /// Extra names or globs to exclude, comma-separated; may be repeated
    #[arg(short, long, value_name = "PATTERNS", value_delimiter = ',')]
    exclude: Vec<String>,

    /// Do not apply the default directory exclusions
    #[arg(long)]
    no_default_excludes: bool,

    /// Match exclusions case-insensitively
    #[arg(long)]
    ignore_case: bool,

    /// TOML file with backup options; flags given here take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verify the archive after writing: crc32, sha256 or blake3
    #[arg(long, value_name = "ALGORITHM")]
    verify: Option<ChecksumAlgorithm>,

    /// Emit newline-delimited JSON events instead of text
    #[arg(long)]
    json: bool,

    /// Log filter for stderr diagnostics (overridden by RUST_LOG)
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

const EXIT_COMPLETED: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

/// Minimum spacing of human-readable progress lines
const PRINT_INTERVAL: Duration = Duration::from_millis(250);

/// ProgressCallback that renders the run to an output stream
struct CliProgress<W: Write + Send> {
    json: bool,
    out: Mutex<W>,
    last_print: Mutex<Option<Instant>>,
}

impl<W: Write + Send> CliProgress<W> {
    fn new(out: W, json: bool) -> Self {
        CliProgress {
            json,
            out: Mutex::new(out),
            last_print: Mutex::new(None),
        }
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{:.1}s", elapsed.as_secs_f64())
        }
    }

    fn format_progress(event: &ProgressEvent) -> String {
        format!(
            "Progress: {:.0}% | {:.2} MiB/s | {} / {} | {}/{} files",
            event.percent(),
            event.mib_per_sec(),
            format_size(event.bytes_written, BINARY),
            format_size(event.total_bytes, BINARY),
            event.files_written,
            event.total_files
        )
    }

    fn emit_json(&self, event: &JobEvent) {
        match serde_json::to_string(event) {
            Ok(line) => self.write_line(&line),
            Err(e) => warn!("cannot encode event: {}", e),
        }
    }

    fn write_line(&self, line: &str) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        // A closed stdout must not take the backup down with it.
        let _ = writeln!(out, "{}", line).and_then(|_| out.flush());
    }

    /// Print the final summary. JSON mode already emitted `finished`.
    fn print_result(&self, result: &BackupResult) {
        if self.json {
            return;
        }
        match result {
            BackupResult::Completed(summary) => {
                self.write_line(&format!("Backup complete: {}", summary.archive_path.display()));
                self.write_line(&format!(
                    "Summary: {} files, {}, {}",
                    summary.total_files,
                    format_size(summary.total_bytes, BINARY),
                    Self::format_duration(summary.duration)
                ));
                if !summary.warnings.is_empty() {
                    self.write_line(&format!("Skipped: {} (see warnings above)", summary.warnings.len()));
                }
                if let Some(report) = &summary.verification {
                    self.write_line(&format!(
                        "Verification ({}): {} OK, {} mismatch, {} missing",
                        report.algorithm,
                        report.verified,
                        report.mismatched.len(),
                        report.missing.len()
                    ));
                }
            }
            BackupResult::Failed(failure) => {
                eprintln!("Backup failed ({}): {}", failure.kind, failure.message);
                if let Some(partial) = &failure.partial_output {
                    eprintln!("Partial archive kept at {}", partial.display());
                }
            }
        }
    }
}

impl<W: Write + Send> ProgressCallback for CliProgress<W> {
    fn on_state_changed(&self, state: JobState) {
        if self.json {
            self.emit_json(&JobEvent::StateChanged(state));
        }
    }

    fn on_progress(&self, event: &ProgressEvent) {
        if self.json {
            self.emit_json(&JobEvent::Progress(*event));
            return;
        }

        // Throttle progress lines (max once per 250ms); the final one always prints
        let Ok(mut last) = self.last_print.lock() else {
            return;
        };
        let due = match *last {
            Some(at) => at.elapsed() >= PRINT_INTERVAL,
            None => true,
        };
        if !due && event.percent() < 100.0 {
            return;
        }
        *last = Some(Instant::now());
        drop(last);

        self.write_line(&Self::format_progress(event));
    }

    fn on_warning(&self, warning: &SoftWarning) {
        if self.json {
            self.emit_json(&JobEvent::Warning(warning.clone()));
        } else {
            eprintln!("Warning: {}", warning);
        }
    }

    fn on_job_completed(&self, result: &BackupResult) {
        if self.json {
            self.emit_json(&JobEvent::Finished(result.clone()));
        }
    }
}

/// Merge the config file (if any) with the command-line flags
fn build_options(args: &Args) -> Result<BackupOptions> {
    let mut options = match &args.config {
        Some(path) => BackupOptions::from_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => BackupOptions::default(),
    };

    options.exclude.extend(
        args.exclude
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string),
    );
    if args.no_default_excludes {
        options.use_default_excludes = false;
    }
    if args.ignore_case {
        options.case_insensitive = true;
    }
    if args.verify.is_some() {
        options.verify = args.verify;
    }

    Ok(options)
}

fn exit_code(result: &BackupResult) -> i32 {
    match result.failure_kind() {
        None => EXIT_COMPLETED,
        Some(FailureKind::Cancelled) => EXIT_CANCELLED,
        Some(_) => EXIT_FAILED,
    }
}

/// Parse and validate command-line arguments, then run the job
fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init_logging(&args.log_level) {
        eprintln!("Error: {:#}", e);
        std::process::exit(EXIT_USAGE);
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!("Ctrl-C will not cancel cleanly: {}", e);
    }

    let exit_code = match run_cli(&args, &cancel, io::stdout()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_USAGE
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
///
/// Returns the process exit code. Errors are configuration problems found
/// before the job started.
fn run_cli<W: Write + Send>(args: &Args, cancel: &CancelToken, out: W) -> Result<i32> {
    let options = build_options(args)?;
    let mut job = BackupJob::new(&args.source, args.dest.clone(), options)
        .context("invalid backup options")?;

    let progress = CliProgress::new(out, args.json);
    let result = job.run(Some(&progress), cancel)?;
    progress.print_result(&result);

    Ok(exit_code(&result))
}
