//! Filter specifications and follower keys
//!
//! A [`FilterSpec`] is an installed intent to follow files: a named source,
//! a base directory, a list of glob patterns applied to file base-names,
//! and the handler plus engine parameters that matched files are bound to.
//!
//! A [`FollowerKey`] is the `(config_name, file_path)` pair that uniquely
//! identifies a live follower. The same physical file followed under two
//! config names yields two independent followers with independent offsets;
//! a file matched by several patterns of the same spec yields one.
//!
//! ## Pattern grammar
//!
//! Patterns are a comma-separated list of shell globs, optionally wrapped
//! in a single leading `{` and trailing `}`:
//!
//! ```text
//! *.log
//! {access*,error*}
//! app-*.log,app-*.out
//! ```
//!
//! Each glob is matched against the base-name of a file, never the path.
//! A file matches a spec iff any one pattern matches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::Pattern;

use super::engine::EngineParams;
use super::errors::DomainError;
use crate::ports::Handler;

// ============================================================================
// FollowerKey
// ============================================================================

/// Identity of a follower within the process: `(config_name, file_path)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FollowerKey {
    /// Name of the logical source (the spec's `config_name`)
    pub config_name: String,
    /// Absolute path of the followed file
    pub path: PathBuf,
}

impl FollowerKey {
    /// Builds a key from a config name and path
    pub fn new(config_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            config_name: config_name.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for FollowerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.config_name, self.path.display())
    }
}

// ============================================================================
// Pattern grammar
// ============================================================================

/// Parses the pattern grammar into compiled globs
///
/// Strips one optional enclosing `{`/`}` pair, splits on commas, and
/// compiles each piece. Whitespace around pieces is trimmed; empty pieces
/// are rejected.
pub fn parse_patterns(raw: &str) -> Result<Vec<Pattern>, DomainError> {
    let trimmed = raw.trim();
    let inner = match (trimmed.strip_prefix('{'), trimmed.strip_suffix('}')) {
        (Some(_), Some(_)) => &trimmed[1..trimmed.len() - 1],
        _ => trimmed,
    };

    let mut patterns = Vec::new();
    for piece in inner.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            return Err(DomainError::EmptyPatternList(raw.to_string()));
        }
        let pattern = Pattern::new(piece).map_err(|e| DomainError::InvalidPattern {
            pattern: piece.to_string(),
            reason: e.msg.to_string(),
        })?;
        patterns.push(pattern);
    }

    if patterns.is_empty() {
        return Err(DomainError::EmptyPatternList(raw.to_string()));
    }
    Ok(patterns)
}

// ============================================================================
// FilterSpec
// ============================================================================

/// An installed intent to follow files under a directory
///
/// Created from configuration and destroyed only at shutdown. Two specs are
/// equal iff all attributes are equal (the handler by reference identity);
/// equal specs are deduplicated by the filter manager.
#[derive(Clone)]
pub struct FilterSpec {
    config_name: String,
    base_dir: PathBuf,
    raw_patterns: String,
    patterns: Vec<Pattern>,
    recursive: bool,
    engine: EngineParams,
    handler: Arc<dyn Handler>,
}

impl FilterSpec {
    /// Builds a spec, parsing and validating the pattern grammar
    ///
    /// # Arguments
    /// * `config_name` - Name of the logical source
    /// * `base_dir` - Absolute directory the patterns apply under
    /// * `patterns` - Pattern grammar text (see module docs)
    /// * `recursive` - Whether subdirectories are followed as well
    /// * `engine` - Record-extraction engine parameters
    /// * `handler` - Consumer that receives extracted records
    ///
    /// # Errors
    /// Returns a [`DomainError`] if the directory is not absolute or the
    /// pattern grammar does not parse.
    pub fn new(
        config_name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        patterns: &str,
        recursive: bool,
        engine: EngineParams,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, DomainError> {
        let base_dir = base_dir.into();
        if !base_dir.is_absolute() {
            return Err(DomainError::RelativePath(
                base_dir.display().to_string(),
            ));
        }
        let compiled = parse_patterns(patterns)?;
        Ok(Self {
            config_name: config_name.into(),
            base_dir,
            raw_patterns: patterns.to_string(),
            patterns: compiled,
            recursive,
            engine,
            handler,
        })
    }

    /// Returns a clone of this spec rooted at a different directory
    ///
    /// Used to extend a recursive spec onto a newly created subdirectory.
    pub fn with_base_dir(&self, base_dir: impl Into<PathBuf>) -> Self {
        let mut clone = self.clone();
        clone.base_dir = base_dir.into();
        clone
    }

    /// True iff any pattern matches the given file base-name
    pub fn matches_name(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// True iff `path` sits directly in this spec's directory and its
    /// base-name matches a pattern
    pub fn matches_path(&self, path: &Path) -> bool {
        if path.parent() != Some(self.base_dir.as_path()) {
            return false;
        }
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.matches_name(n))
    }

    /// Name of the logical source
    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    /// Directory the patterns apply under
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The pattern grammar text as configured
    pub fn raw_patterns(&self) -> &str {
        &self.raw_patterns
    }

    /// Whether subdirectories are followed as well
    pub fn recursive(&self) -> bool {
        self.recursive
    }

    /// Engine parameters for files matched by this spec
    pub fn engine(&self) -> &EngineParams {
        &self.engine
    }

    /// The record consumer for this spec
    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    /// Key for a file followed under this spec
    pub fn key_for(&self, path: &Path) -> FollowerKey {
        FollowerKey::new(self.config_name.clone(), path)
    }
}

impl PartialEq for FilterSpec {
    fn eq(&self, other: &Self) -> bool {
        self.config_name == other.config_name
            && self.base_dir == other.base_dir
            && self.raw_patterns == other.raw_patterns
            && self.recursive == other.recursive
            && self.engine == other.engine
            && Arc::ptr_eq(&self.handler, &other.handler)
    }
}

impl std::fmt::Debug for FilterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterSpec")
            .field("config_name", &self.config_name)
            .field("base_dir", &self.base_dir)
            .field("patterns", &self.raw_patterns)
            .field("recursive", &self.recursive)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct NullHandler;

    #[async_trait]
    impl Handler for NullHandler {
        async fn handle(
            &self,
            _record: &[u8],
            _timestamp: DateTime<Utc>,
            _source: &Path,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn spec(patterns: &str) -> FilterSpec {
        FilterSpec::new(
            "src",
            "/var/log",
            patterns,
            false,
            EngineParams::line(),
            Arc::new(NullHandler),
        )
        .unwrap()
    }

    // ------------------------------------------------------------------
    // pattern grammar
    // ------------------------------------------------------------------

    #[test]
    fn test_single_pattern() {
        let s = spec("paco*");
        assert!(s.matches_name("paco123"));
        assert!(!s.matches_name("chico123"));
    }

    #[test]
    fn test_comma_separated_alternatives() {
        let s = spec("access*,error*");
        assert!(s.matches_name("access.log"));
        assert!(s.matches_name("error.log"));
        assert!(!s.matches_name("debug.log"));
    }

    #[test]
    fn test_brace_wrapped_alternatives() {
        let s = spec("{access*,error*}");
        assert!(s.matches_name("access.log"));
        assert!(s.matches_name("error.log"));
        assert!(!s.matches_name("debug.log"));
    }

    #[test]
    fn test_empty_piece_rejected() {
        assert!(matches!(
            parse_patterns("a*,,b*"),
            Err(DomainError::EmptyPatternList(_))
        ));
        assert!(matches!(
            parse_patterns(""),
            Err(DomainError::EmptyPatternList(_))
        ));
    }

    #[test]
    fn test_bad_glob_rejected() {
        assert!(matches!(
            parse_patterns("[unclosed"),
            Err(DomainError::InvalidPattern { .. })
        ));
    }

    // ------------------------------------------------------------------
    // path matching is base-name only
    // ------------------------------------------------------------------

    #[test]
    fn test_matches_path_requires_exact_directory() {
        let s = spec("*.log");
        assert!(s.matches_path(Path::new("/var/log/syslog.log")));
        // base-name matches, but the file lives one level deeper
        assert!(!s.matches_path(Path::new("/var/log/nested/syslog.log")));
        assert!(!s.matches_path(Path::new("/tmp/syslog.log")));
    }

    // ------------------------------------------------------------------
    // spec equality / dedupe semantics
    // ------------------------------------------------------------------

    #[test]
    fn test_equality_requires_same_handler_instance() {
        let h: Arc<dyn Handler> = Arc::new(NullHandler);
        let a = FilterSpec::new(
            "src",
            "/var/log",
            "*.log",
            false,
            EngineParams::line(),
            Arc::clone(&h),
        )
        .unwrap();
        let b = FilterSpec::new(
            "src",
            "/var/log",
            "*.log",
            false,
            EngineParams::line(),
            Arc::clone(&h),
        )
        .unwrap();
        let c = FilterSpec::new(
            "src",
            "/var/log",
            "*.log",
            false,
            EngineParams::line(),
            Arc::new(NullHandler),
        )
        .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_relative_dir_rejected() {
        let res = FilterSpec::new(
            "src",
            "var/log",
            "*.log",
            false,
            EngineParams::line(),
            Arc::new(NullHandler),
        );
        assert!(matches!(res, Err(DomainError::RelativePath(_))));
    }

    #[test]
    fn test_with_base_dir_keeps_everything_else() {
        let s = spec("*.log").with_base_dir("/var/log/nested");
        assert_eq!(s.base_dir(), Path::new("/var/log/nested"));
        assert_eq!(s.config_name(), "src");
        assert!(s.matches_name("x.log"));
    }

    // ------------------------------------------------------------------
    // key
    // ------------------------------------------------------------------

    #[test]
    fn test_key_for() {
        let s = spec("*.log");
        let key = s.key_for(Path::new("/var/log/syslog.log"));
        assert_eq!(key.config_name, "src");
        assert_eq!(key.path, PathBuf::from("/var/log/syslog.log"));
    }

    #[test]
    fn test_key_ordering_is_deterministic() {
        let a = FollowerKey::new("a", "/x");
        let b = FollowerKey::new("b", "/x");
        let c = FollowerKey::new("a", "/y");
        assert!(a < b);
        assert!(a < c);
    }
}
