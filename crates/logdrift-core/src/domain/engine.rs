//! Record-extraction engine parameters
//!
//! An [`EngineParams`] value selects which per-file record engine a
//! follower runs and carries its arguments. It is pure data: the engines
//! themselves live in the follower runtime, which builds one from these
//! parameters when a file is opened.

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Default ceiling on a single record, in bytes (16 MiB)
pub const DEFAULT_MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Which record-extraction algorithm a follower runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Newline-delimited records, trailing CR/LF stripped
    Line,
    /// Records delimited by occurrences of a regular expression
    Regex,
}

/// Engine selection plus engine-specific arguments
///
/// Construct via [`EngineParams::line`] or [`EngineParams::regex`]; the
/// regex constructor validates the delimiter expression eagerly so a bad
/// configuration fails at startup rather than at first read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineParams {
    kind: EngineKind,
    pattern: Option<String>,
    max_record_len: usize,
}

impl EngineParams {
    /// Parameters for the newline engine
    pub fn line() -> Self {
        Self {
            kind: EngineKind::Line,
            pattern: None,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
        }
    }

    /// Parameters for the regex engine with the given delimiter expression
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidRegex`] if the expression does not
    /// compile.
    pub fn regex(pattern: impl Into<String>) -> Result<Self, DomainError> {
        let pattern = pattern.into();
        regex::bytes::Regex::new(&pattern).map_err(|e| DomainError::InvalidRegex {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            kind: EngineKind::Regex,
            pattern: Some(pattern),
            max_record_len: DEFAULT_MAX_RECORD_LEN,
        })
    }

    /// Overrides the maximum record length in bytes
    pub fn with_max_record_len(mut self, max: usize) -> Self {
        self.max_record_len = max;
        self
    }

    /// The selected engine kind
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// The delimiter expression, present iff the kind is [`EngineKind::Regex`]
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    /// Ceiling on a single record, in bytes
    pub fn max_record_len(&self) -> usize {
        self.max_record_len
    }
}
