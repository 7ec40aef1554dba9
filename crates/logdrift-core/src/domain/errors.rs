//! Domain error types
//!
//! This module defines error types specific to domain validation,
//! including malformed glob patterns, invalid regular expressions and
//! unusable paths.

use thiserror::Error;

/// Errors that can occur while validating domain values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A glob pattern failed to parse
    #[error("Invalid glob pattern `{pattern}`: {reason}")]
    InvalidPattern {
        /// The offending pattern text
        pattern: String,
        /// Parser diagnostic
        reason: String,
    },

    /// A pattern list contained no usable patterns
    #[error("Empty pattern list: {0}")]
    EmptyPatternList(String),

    /// A record-delimiter regular expression failed to compile
    #[error("Invalid record delimiter regex `{pattern}`: {reason}")]
    InvalidRegex {
        /// The offending expression
        pattern: String,
        /// Compiler diagnostic
        reason: String,
    },

    /// The regex engine was selected without a delimiter expression
    #[error("Regex engine selected for `{0}` but no delimiter expression was given")]
    MissingRegex(String),

    /// A path that must be absolute was not
    #[error("Path is not absolute: {0}")]
    RelativePath(String),
}
