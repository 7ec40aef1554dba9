//! Record consumer port (driven/secondary port)
//!
//! The follower runtime hands every extracted record to a [`Handler`].
//! Handlers are external collaborators: a network shipper, a test
//! collector, a stdout sink. The runtime guarantees per-file ordering and
//! that a follower's byte offset is only advanced after `handle` returns
//! success.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because consumer failures are
//!   implementation-specific and don't need domain-level classification.
//! - A non-ok result stops further record emission from the offending
//!   follower without advancing its offset; it does not tear down the
//!   system.

use std::path::Path;

use chrono::{DateTime, Utc};

/// Downstream consumer of extracted records
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Consumes one record
    ///
    /// # Arguments
    /// * `record` - The record bytes, delimiters stripped per the engine
    /// * `timestamp` - Wall-clock instant of the handoff (not of the read)
    /// * `source` - Path of the file the record was extracted from
    ///
    /// # Errors
    /// Any error halts the emitting follower; its offset is left at the
    /// position before this record.
    async fn handle(
        &self,
        record: &[u8],
        timestamp: DateTime<Utc>,
        source: &Path,
    ) -> anyhow::Result<()>;
}
