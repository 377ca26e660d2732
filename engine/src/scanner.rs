//! Source tree enumeration.
//!
//! Walks the backup root with an explicit stack, pruning excluded directories
//! before they are opened. Real directories are walked first; symlinked
//! directories are deferred until the real tree is done, and are followed only
//! when their target lies inside the root and was not walked already. Every
//! physical directory (keyed by its canonical path) is traversed at most once,
//! which breaks link cycles without relying on recursion depth.
//!
//! Anything that goes wrong below the root is a soft warning: the scan is a
//! best-effort snapshot of a filesystem that may be changing under it.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::filter::PathFilter;
use crate::model::{FileEntry, ScanResult, SoftWarning};

struct PendingDir {
    path: PathBuf,
    relative: String,
    is_link: bool,
}

struct Walk<'a> {
    filter: &'a PathFilter,
    visited: HashSet<PathBuf>,
    entries: Vec<FileEntry>,
    warnings: Vec<SoftWarning>,
}

impl Walk<'_> {
    fn soft(&mut self, path: &Path, message: String) {
        warn!(path = %path.display(), "{}", message);
        self.warnings.push(SoftWarning::scan(path, message));
    }

    fn push_file(&mut self, path: PathBuf, relative: String, metadata: &fs::Metadata) {
        self.entries.push(FileEntry {
            source_path: path,
            relative_path: relative,
            size: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }

    /// List one directory, recording files and returning subdirectories to
    /// visit, in name order.
    fn visit(&mut self, dir: &PendingDir) -> io::Result<Vec<PendingDir>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(&dir.path)? {
            match entry {
                Ok(entry) => children.push(entry),
                Err(e) => self.soft(&dir.path, format!("failed to read directory entry: {}", e)),
            }
        }
        children.sort_by_key(|entry| entry.file_name());

        let mut subdirs = Vec::new();
        for entry in children {
            let path = entry.path();
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => {
                    self.soft(&path, "skipped: name is not valid UTF-8".to_string());
                    continue;
                }
            };
            let relative = if dir.relative.is_empty() {
                name
            } else {
                format!("{}/{}", dir.relative, name)
            };

            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    self.soft(&path, format!("skipped: {}", e));
                    continue;
                }
            };

            // Links are classified by their target; `fs::metadata` follows them.
            let is_link = file_type.is_symlink();
            let (is_dir, metadata) = if is_link {
                match fs::metadata(&path) {
                    Ok(metadata) => (metadata.is_dir(), Some(metadata)),
                    Err(e) => {
                        self.soft(&path, format!("skipped broken link: {}", e));
                        continue;
                    }
                }
            } else {
                (file_type.is_dir(), None)
            };

            if let Some(rule) = self.filter.matching_rule(&relative, is_dir) {
                debug!(path = %relative, rule = rule.pattern(), "excluded");
                continue;
            }

            if is_dir {
                subdirs.push(PendingDir {
                    path,
                    relative,
                    is_link,
                });
                continue;
            }

            let metadata = match metadata {
                Some(metadata) => metadata,
                None => match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        self.soft(&path, format!("skipped: {}", e));
                        continue;
                    }
                },
            };
            if metadata.is_file() {
                self.push_file(path, relative, &metadata);
            } else {
                debug!(path = %relative, "skipping special file");
            }
        }
        Ok(subdirs)
    }
}

/// Scan `root` and return every non-excluded regular file, sorted by
/// relative path.
///
/// # Errors
/// Returns EngineError if the root is missing, is not a directory, cannot be
/// listed, or contains nothing to back up. Problems below the root are
/// recorded in `ScanResult::warnings` instead.
pub fn scan(root: &Path, filter: &PathFilter) -> Result<ScanResult, EngineError> {
    let metadata = fs::metadata(root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => EngineError::SourceNotFound {
            path: root.to_path_buf(),
        },
        _ => EngineError::SourceAccessDenied {
            path: root.to_path_buf(),
            source: e,
        },
    })?;
    if !metadata.is_dir() {
        return Err(EngineError::SourceNotDirectory {
            path: root.to_path_buf(),
        });
    }

    let root_identity = fs::canonicalize(root).map_err(|source| EngineError::SourceAccessDenied {
        path: root.to_path_buf(),
        source,
    })?;

    let mut walk = Walk {
        filter,
        visited: HashSet::new(),
        entries: Vec::new(),
        warnings: Vec::new(),
    };

    let mut stack = vec![PendingDir {
        path: root.to_path_buf(),
        relative: String::new(),
        is_link: false,
    }];
    // Symlinked directories wait until every real directory has been claimed.
    let mut deferred = VecDeque::new();

    while let Some(dir) = stack.pop().or_else(|| deferred.pop_front()) {
        let is_root = dir.relative.is_empty();

        let identity = if is_root {
            root_identity.clone()
        } else {
            match fs::canonicalize(&dir.path) {
                Ok(identity) => identity,
                Err(e) => {
                    walk.soft(&dir.path, format!("skipped directory: {}", e));
                    continue;
                }
            }
        };
        if dir.is_link && !identity.starts_with(&root_identity) {
            debug!(path = %dir.relative, target = %identity.display(), "link leaves the root, not following");
            continue;
        }
        if !walk.visited.insert(identity.clone()) {
            debug!(path = %dir.relative, target = %identity.display(), "already visited, not following");
            continue;
        }

        match walk.visit(&dir) {
            Ok(subdirs) => {
                let (links, real): (Vec<_>, Vec<_>) =
                    subdirs.into_iter().partition(|subdir| subdir.is_link);
                stack.extend(real.into_iter().rev());
                deferred.extend(links);
            }
            Err(e) if is_root => {
                return Err(EngineError::SourceAccessDenied {
                    path: root.to_path_buf(),
                    source: e,
                })
            }
            Err(e) => walk.soft(&dir.path, format!("skipped unreadable directory: {}", e)),
        }
    }

    let result = ScanResult::from_entries(walk.entries, walk.warnings);
    if result.is_empty() {
        return Err(EngineError::NothingToBackUp {
            path: root.to_path_buf(),
        });
    }

    debug!(
        files = result.total_files,
        bytes = result.total_bytes,
        warnings = result.warnings.len(),
        "scan complete"
    );
    Ok(result)
}
