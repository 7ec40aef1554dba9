//! Stable file identity
//!
//! A [`FileIdentity`] is the `(device, inode)` pair of a file, retrievable
//! from either a path or an already-open handle. It is stable across
//! renames, which makes it the primitive the follower runtime uses to
//! recognise that a path now names a different physical file, or that a
//! different path names the same physical file (a rename).

use std::fs::{File, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Platform-stable identity of a physical file
///
/// On POSIX the pair is `(st_dev, st_ino)`. Two handles or paths with equal
/// identities refer to the same underlying file regardless of the name they
/// were reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Device number the file lives on
    pub major: u64,
    /// Inode number within that device
    pub minor: u64,
}

impl FileIdentity {
    /// Builds an identity from already-fetched metadata
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            major: meta.dev(),
            minor: meta.ino(),
        }
    }

    /// Stats `path` and returns its identity
    ///
    /// # Errors
    /// Returns the underlying I/O error if the path cannot be stat-ed
    /// (typically `NotFound` when the file has already vanished).
    pub fn of_path(path: &Path) -> io::Result<Self> {
        Ok(Self::from_metadata(&std::fs::metadata(path)?))
    }

    /// Returns the identity of an open handle
    ///
    /// Reading the identity from the handle rather than the path means the
    /// result stays correct even if the name was unlinked or rebound after
    /// the open.
    pub fn of_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}
