//! Runtime error types
//!
//! [`FollowError`] is the error enum shared by the state store, followers
//! and both managers. Construction and start-up errors are fatal to the
//! caller; errors inside event loops are logged and the loop continues;
//! errors inside a follower terminate that follower alone.

use std::path::PathBuf;

use thiserror::Error;

use logdrift_core::domain::DomainError;

/// Errors surfaced by the follower runtime
#[derive(Debug, Error)]
pub enum FollowError {
    /// Operation issued after `close` or before construction completed
    #[error("Component is not ready (closed or not yet started)")]
    NotReady,

    /// On-disk state path exists but is not a regular file
    #[error("State path exists but is not a regular file: {0}")]
    InvalidStateFile(PathBuf),

    /// A spec's base directory exists but is not a directory
    #[error("Watch location exists but is not a directory: {0}")]
    LocationNotDir(PathBuf),

    /// `start()` with neither watched nor removed directories
    #[error("No directories to watch")]
    NoDirectories,

    /// Second `start()` or `catchup()`
    #[error("Already started")]
    AlreadyStarted,

    /// Kernel dropped notification events; reported, never fatal
    #[error("Kernel event queue overflowed; raise fs.inotify.max_queued_events")]
    KernelQueueOverflow,

    /// The downstream handler rejected a record; halts one follower
    #[error("Record handler failed")]
    Handler(#[source] anyhow::Error),

    /// Invalid filter or engine specification
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Failure installing or removing an OS watch
    #[error("Filesystem watch error")]
    Notify(#[from] notify::Error),

    /// Generic wrapping of OS errors from open/read/stat/readdir/rename
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, FollowError>;

/// True for read errors that mean the file vanished underneath us.
///
/// Followers swallow these and exit cleanly; any other read error is
/// recorded and terminates the follower's task.
pub(crate) fn is_vanished(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}
