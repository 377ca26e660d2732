//! Checksum and archive verification.
//!
//! This module provides:
//! - Multiple checksum algorithms (CRC32, SHA-256, BLAKE3)
//! - Streaming checksum computation over any reader
//! - Post-write verification of an archive against its source files

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::EngineError;
use crate::model::{FileEntry, SoftWarning};

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32 (fast, 32-bit, the same check ZIP stores per entry)
    Crc32,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crc32" => Ok(Self::Crc32),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!(
                "unknown checksum algorithm '{}' (expected crc32, sha256 or blake3)",
                other
            )),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

enum Hasher {
    Crc32(crc32fast::Hasher),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(<sha2::Sha256 as sha2::Digest>::new()),
            ChecksumAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Crc32(h) => h.update(data),
            Hasher::Sha256(h) => sha2::Digest::update(h, data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize(self) -> ChecksumValue {
        match self {
            Hasher::Crc32(h) => {
                ChecksumValue::new(ChecksumAlgorithm::Crc32, format!("{:08x}", h.finalize()))
            }
            Hasher::Sha256(h) => ChecksumValue::new(
                ChecksumAlgorithm::Sha256,
                format!("{:x}", sha2::Digest::finalize(h)),
            ),
            Hasher::Blake3(h) => {
                ChecksumValue::new(ChecksumAlgorithm::Blake3, h.finalize().to_hex().to_string())
            }
        }
    }
}

/// Compute a checksum over everything `reader` yields.
pub fn compute_checksum<R: Read>(
    reader: &mut R,
    algorithm: ChecksumAlgorithm,
) -> io::Result<ChecksumValue> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(hasher.finalize())
}

/// Compute checksum for a file
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> io::Result<ChecksumValue> {
    let mut file = File::open(path)?;
    compute_checksum(&mut file, algorithm)
}

/// Outcome of comparing an archive with its sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub algorithm: ChecksumAlgorithm,

    /// Entries whose archive and source digests matched
    pub verified: u64,

    /// Entries whose digests differ
    pub mismatched: Vec<String>,

    /// Entries expected in the archive but absent or unreadable there
    pub missing: Vec<String>,

    /// Sources that could no longer be read for comparison
    pub unreadable_sources: Vec<SoftWarning>,
}

impl VerificationReport {
    /// True when every expected entry was present and matched.
    pub fn passed(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Re-read `archive` and compare each expected entry with its source file.
///
/// # Errors
/// Returns EngineError only if the archive itself cannot be opened; per-entry
/// problems are reported in the `VerificationReport`.
pub fn verify_archive<'a, I>(
    archive: &Path,
    entries: I,
    algorithm: ChecksumAlgorithm,
) -> Result<VerificationReport, EngineError>
where
    I: IntoIterator<Item = &'a FileEntry>,
{
    let file = File::open(archive).map_err(|e| EngineError::Archive {
        path: archive.to_path_buf(),
        source: zip::result::ZipError::Io(e),
    })?;
    let mut zip = ZipArchive::new(file).map_err(|source| EngineError::Archive {
        path: archive.to_path_buf(),
        source,
    })?;

    let mut report = VerificationReport {
        algorithm,
        verified: 0,
        mismatched: Vec::new(),
        missing: Vec::new(),
        unreadable_sources: Vec::new(),
    };

    for entry in entries {
        let stored = match zip.by_name(&entry.relative_path) {
            Ok(mut stored) => compute_checksum(&mut stored, algorithm),
            Err(e) => {
                warn!(entry = %entry.relative_path, "missing from archive: {}", e);
                report.missing.push(entry.relative_path.clone());
                continue;
            }
        };
        let stored = match stored {
            Ok(value) => value,
            Err(e) => {
                // A CRC failure inside the zip reader surfaces here.
                warn!(entry = %entry.relative_path, "unreadable in archive: {}", e);
                report.missing.push(entry.relative_path.clone());
                continue;
            }
        };

        let source = match compute_file_checksum(&entry.source_path, algorithm) {
            Ok(value) => value,
            Err(e) => {
                report.unreadable_sources.push(SoftWarning::write(
                    &entry.source_path,
                    format!("cannot read source for verification: {}", e),
                ));
                continue;
            }
        };

        if stored == source {
            report.verified += 1;
        } else {
            debug!(entry = %entry.relative_path, %stored, %source, "checksum mismatch");
            report.mismatched.push(entry.relative_path.clone());
        }
    }

    Ok(report)
}
