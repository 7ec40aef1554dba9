//! Record-extraction engines
//!
//! An engine turns the raw byte stream read from one file into delimited
//! records while accounting for every consumed byte, so the follower can
//! advance its offset cell exactly.
//!
//! Two engines exist:
//!
//! - [`LineEngine`] - records are `\n`-delimited; trailing CR/LF bytes are
//!   stripped and empty lines are skipped (their bytes still count as
//!   consumed).
//! - [`RegexEngine`] - records are delimited by occurrences of a regular
//!   expression. Because the closing delimiter of record N is the opening
//!   of record N+1, the engine holds a rolling buffer and emits record N
//!   only once match N+1 appears; an idle flush drains the tail.
//!
//! Both engines guard against unbounded buffering: once the rolling buffer
//! exceeds the configured maximum record length, its contents are emitted
//! as one oversized record rather than dropped, keeping offsets byte-exact.

use std::time::Duration;

use tracing::warn;

use logdrift_core::domain::{EngineKind, EngineParams};

use crate::error::Result;

/// How long line-engine partials may sit before an idle flush
const LINE_IDLE_FLUSH: Duration = Duration::from_secs(3);

/// How long the regex engine waits for the next delimiter before flushing
const REGEX_IDLE_FLUSH: Duration = Duration::from_secs(5);

// ============================================================================
// Record
// ============================================================================

/// One extracted record plus the absolute offset just past its source bytes
///
/// `offset_after` covers the record's own bytes, its delimiter, and any
/// skipped bytes (empty lines) that preceded it, so storing it into the
/// offset cell never re-reads or skips input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record content, delimiters stripped per the engine
    pub bytes: Vec<u8>,
    /// Absolute file offset of the first byte after this record's source
    pub offset_after: u64,
}

// ============================================================================
// RecordEngine trait
// ============================================================================

/// Per-follower algorithm turning bytes into delimited records
pub trait RecordEngine: Send {
    /// Feeds newly read bytes, appending completed records to `out`
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Record>);

    /// Emits the buffered tail as one record, if any (idle/closing flush)
    fn flush(&mut self) -> Option<Record>;

    /// Bytes read from the file but not yet emitted or discarded
    fn buffered(&self) -> usize;

    /// Absolute offset of everything consumed (emitted or skipped)
    fn consumed(&self) -> u64;

    /// Forgets all buffered bytes and rebases at `offset` (truncation)
    fn reset(&mut self, offset: u64);

    /// How long buffered data may sit before an idle flush fires
    fn idle_flush_after(&self) -> Duration;
}

/// Builds the engine selected by `params`, rebased at `start_offset`
pub fn build_engine(params: &EngineParams, start_offset: u64) -> Result<Box<dyn RecordEngine>> {
    match params.kind() {
        EngineKind::Line => Ok(Box::new(LineEngine::new(
            start_offset,
            params.max_record_len(),
        ))),
        EngineKind::Regex => {
            // The params constructor validated the expression; an empty
            // pattern here is a construction bug surfaced as a domain error.
            let pattern = params.pattern().unwrap_or_default();
            let re = regex::bytes::Regex::new(pattern).map_err(|e| {
                logdrift_core::domain::DomainError::InvalidRegex {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Box::new(RegexEngine::new(
                re,
                start_offset,
                params.max_record_len(),
            )))
        }
    }
}

// ============================================================================
// LineEngine
// ============================================================================

/// Newline-delimited record extraction
pub struct LineEngine {
    /// Partial line carried between pushes; `base` is the offset of `buf[0]`
    buf: Vec<u8>,
    base: u64,
    max_len: usize,
}

impl LineEngine {
    pub fn new(start_offset: u64, max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            base: start_offset,
            max_len,
        }
    }
}

impl RecordEngine for LineEngine {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Record>) {
        self.buf.extend_from_slice(chunk);

        let mut start = 0usize;
        while let Some(rel) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let nl = start + rel;
            let mut end = nl;
            while end > start && self.buf[end - 1] == b'\r' {
                end -= 1;
            }
            // An empty line yields no record; its bytes still count as
            // consumed via the drain below.
            if end > start {
                out.push(Record {
                    bytes: self.buf[start..end].to_vec(),
                    offset_after: self.base + nl as u64 + 1,
                });
            }
            start = nl + 1;
        }
        if start > 0 {
            self.buf.drain(..start);
            self.base += start as u64;
        }

        if self.buf.len() > self.max_len {
            warn!(
                len = self.buf.len(),
                max = self.max_len,
                "Unterminated line exceeded maximum record length, emitting oversized record"
            );
            if let Some(record) = self.flush() {
                out.push(record);
            }
        }
    }

    fn flush(&mut self) -> Option<Record> {
        if self.buf.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.buf);
        self.base += bytes.len() as u64;
        Some(Record {
            bytes,
            offset_after: self.base,
        })
    }

    fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn consumed(&self) -> u64 {
        self.base
    }

    fn reset(&mut self, offset: u64) {
        self.buf.clear();
        self.base = offset;
    }

    fn idle_flush_after(&self) -> Duration {
        LINE_IDLE_FLUSH
    }
}

// ============================================================================
// RegexEngine
// ============================================================================

/// Regex-delimited record extraction
///
/// A record begins at one delimiter match and ends immediately before the
/// next. A match at byte 0 of the buffer is the current record's own
/// opening delimiter, so the search for the closing boundary resumes past
/// it.
pub struct RegexEngine {
    re: regex::bytes::Regex,
    buf: Vec<u8>,
    base: u64,
    max_len: usize,
}

impl RegexEngine {
    pub fn new(re: regex::bytes::Regex, start_offset: u64, max_len: usize) -> Self {
        Self {
            re,
            buf: Vec::new(),
            base: start_offset,
            max_len,
        }
    }

    /// Index where the frontmost complete record ends, if one is complete
    fn next_boundary(&self) -> Option<usize> {
        let first = self.re.find(&self.buf)?;
        if first.start() > 0 {
            // Preamble before the first delimiter forms its own record.
            return Some(first.start());
        }
        // Guard zero-width matches so the search always advances.
        let from = if first.end() > 0 { first.end() } else { 1 };
        if from >= self.buf.len() {
            return None;
        }
        self.re.find_at(&self.buf, from).map(|m| m.start())
    }
}

impl RecordEngine for RegexEngine {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Record>) {
        self.buf.extend_from_slice(chunk);

        while let Some(cut) = self.next_boundary() {
            let bytes: Vec<u8> = self.buf[..cut].to_vec();
            self.buf.drain(..cut);
            self.base += cut as u64;
            out.push(Record {
                bytes,
                offset_after: self.base,
            });
        }

        if self.buf.len() > self.max_len {
            warn!(
                len = self.buf.len(),
                max = self.max_len,
                "Rolling buffer exceeded maximum record length, emitting oversized record"
            );
            if let Some(record) = self.flush() {
                out.push(record);
            }
        }
    }

    fn flush(&mut self) -> Option<Record> {
        if self.buf.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.buf);
        self.base += bytes.len() as u64;
        Some(Record {
            bytes,
            offset_after: self.base,
        })
    }

    fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn consumed(&self) -> u64 {
        self.base
    }

    fn reset(&mut self, offset: u64) {
        self.buf.clear();
        self.base = offset;
    }

    fn idle_flush_after(&self) -> Duration {
        REGEX_IDLE_FLUSH
    }
}

// ============================================================================
// Unit tests
// ============================================================================
