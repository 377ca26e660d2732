//! Path exclusion rules.
//!
//! A `PathFilter` decides whether an entry under the backup root is left out.
//! Paths are always relative to the root and `/`-separated. Matching is done
//! on whole path segments or whole globs, never on substrings, so a rule for
//! `build` leaves `buildscripts/` alone.

use globset::{GlobBuilder, GlobMatcher};

use crate::error::EngineError;

/// Directory names excluded unless the caller says otherwise.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    "node_modules",
    "venv",
    "__pycache__",
    "dist",
    "build",
];

#[derive(Debug, Clone)]
enum Matcher {
    /// Exact segment name
    Name(String),
    /// Glob applied to each segment on its own
    SegmentGlob(GlobMatcher),
    /// Glob applied to the relative path (and its directory prefixes)
    PathGlob(GlobMatcher),
}

/// A single exclusion pattern.
#[derive(Debug, Clone)]
pub struct ExclusionRule {
    pattern: String,
    matcher: Matcher,
    dirs_only: bool,
    case_insensitive: bool,
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

impl ExclusionRule {
    /// Parse a pattern. Plain names match a path segment exactly; patterns
    /// with glob metacharacters are compiled with globset, and match the whole
    /// relative path when they contain a `/`.
    pub fn parse(pattern: &str, dirs_only: bool, case_insensitive: bool) -> Result<Self, EngineError> {
        let trimmed = pattern.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(EngineError::InvalidConfig {
                path: None,
                message: format!("empty exclusion pattern '{}'", pattern),
            });
        }

        let matcher = if is_glob(trimmed) || trimmed.contains('/') {
            let glob = GlobBuilder::new(trimmed)
                .literal_separator(true)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|source| EngineError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?
                .compile_matcher();
            if trimmed.contains('/') {
                Matcher::PathGlob(glob)
            } else {
                Matcher::SegmentGlob(glob)
            }
        } else if case_insensitive {
            Matcher::Name(trimmed.to_lowercase())
        } else {
            Matcher::Name(trimmed.to_string())
        };

        Ok(ExclusionRule {
            pattern: trimmed.to_string(),
            matcher,
            dirs_only,
            case_insensitive,
        })
    }

    /// A rule that excludes directories with this exact name at any depth.
    pub fn directory(name: &str) -> Result<Self, EngineError> {
        Self::parse(name, true, false)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn dirs_only(&self) -> bool {
        self.dirs_only
    }

    fn segment_matches(&self, segment: &str) -> bool {
        match &self.matcher {
            Matcher::Name(name) if self.case_insensitive => segment.to_lowercase() == *name,
            Matcher::Name(name) => segment == name,
            Matcher::SegmentGlob(glob) => glob.is_match(segment),
            Matcher::PathGlob(_) => false,
        }
    }

    /// Whether this rule excludes `relative_path`, or any directory above it.
    pub fn matches(&self, relative_path: &str, is_dir: bool) -> bool {
        let segments: Vec<&str> = relative_path.split('/').filter(|s| !s.is_empty()).collect();
        let last = segments.len().saturating_sub(1);

        match &self.matcher {
            Matcher::PathGlob(glob) => (0..segments.len()).any(|i| {
                let segment_is_dir = i < last || is_dir;
                (!self.dirs_only || segment_is_dir) && glob.is_match(segments[..=i].join("/"))
            }),
            _ => segments.iter().enumerate().any(|(i, segment)| {
                let segment_is_dir = i < last || is_dir;
                (!self.dirs_only || segment_is_dir) && self.segment_matches(segment)
            }),
        }
    }
}

/// An ordered, immutable set of exclusion rules.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    rules: Vec<ExclusionRule>,
}

impl PathFilter {
    pub fn new(rules: Vec<ExclusionRule>) -> Self {
        PathFilter { rules }
    }

    /// The default directory exclusions followed by caller patterns.
    pub fn with_defaults<S: AsRef<str>>(extra: &[S]) -> Result<Self, EngineError> {
        Self::build(DEFAULT_EXCLUDES, extra, false)
    }

    /// Build a filter from directory-only names and general patterns.
    ///
    /// `directory_names` only ever match directories; `patterns` match files
    /// and directories alike.
    pub fn build<D: AsRef<str>, P: AsRef<str>>(
        directory_names: &[D],
        patterns: &[P],
        case_insensitive: bool,
    ) -> Result<Self, EngineError> {
        let mut rules = Vec::with_capacity(directory_names.len() + patterns.len());
        for name in directory_names {
            rules.push(ExclusionRule::parse(name.as_ref(), true, case_insensitive)?);
        }
        for pattern in patterns {
            rules.push(ExclusionRule::parse(pattern.as_ref(), false, case_insensitive)?);
        }
        Ok(PathFilter { rules })
    }

    pub fn rules(&self) -> &[ExclusionRule] {
        &self.rules
    }

    /// The first rule that excludes this path, if any.
    pub fn matching_rule(&self, relative_path: &str, is_dir: bool) -> Option<&ExclusionRule> {
        self.rules.iter().find(|rule| rule.matches(relative_path, is_dir))
    }

    pub fn should_exclude(&self, relative_path: &str, is_dir: bool) -> bool {
        self.matching_rule(relative_path, is_dir).is_some()
    }
}
