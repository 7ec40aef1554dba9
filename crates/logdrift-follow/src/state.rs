//! Durable per-file offset store
//!
//! The [`StateStore`] persists a map from `(config_name, file_path)` to the
//! byte offset of the next unread byte, so restarts neither duplicate nor
//! lose data. Each live follower shares an [`OffsetCell`] with the store;
//! the store serializes the whole map on every flush.
//!
//! ## On-disk format
//!
//! A single versioned JSON document. Full rewrites are deliberate: follower
//! counts are bounded by the live cap, so an incremental or append encoding
//! buys nothing. Atomicity comes from writing a sibling temporary and
//! renaming it over the target, so a crashed flush leaves either the prior
//! image or a detectable partial temp file, never a torn store.
//!
//! ## Load-time repair
//!
//! Entries whose file no longer exists are dropped; entries whose offset
//! exceeds the file's current size are reset to zero (truncation safety).
//! A corrupt image decodes to the empty store with a warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use logdrift_core::domain::FollowerKey;

use crate::error::{FollowError, Result};

/// Shared, atomically updatable byte offset
///
/// Referenced by at most one live follower; monotonically non-decreasing
/// while the underlying file is not truncated, reset to zero when
/// truncation is detected.
pub type OffsetCell = Arc<AtomicU64>;

/// Version tag written into every image
const STATE_FORMAT_VERSION: u32 = 1;

// ============================================================================
// On-disk image
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StateImage {
    version: u32,
    entries: Vec<StateEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateEntry {
    config: String,
    path: PathBuf,
    offset: u64,
}

// ============================================================================
// StateStore
// ============================================================================

/// Durable, crash-safe offset persistence
///
/// All operations take the store's own lock; the store is the only
/// component whose mutations must survive a crash.
#[derive(Debug)]
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    entries: HashMap<FollowerKey, OffsetCell>,
    closed: bool,
}

impl StateStore {
    /// Opens (or creates) the store backed by `path`
    ///
    /// On first use the store starts empty and the file is created by the
    /// first flush. On subsequent uses the existing image is decoded and
    /// repaired (see module docs).
    ///
    /// # Errors
    /// [`FollowError::InvalidStateFile`] if `path` exists but is not a
    /// regular file; I/O errors from reading an existing image.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::metadata(&path) {
            Ok(meta) if !meta.is_file() => {
                return Err(FollowError::InvalidStateFile(path));
            }
            Ok(_) => load_image(&path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No prior state file, starting empty");
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            inner: Mutex::new(StoreInner {
                path,
                entries,
                closed: false,
            }),
        })
    }

    /// Returns the existing cell for `key` or inserts a new zero cell
    pub fn get_or_create(&self, key: &FollowerKey) -> OffsetCell {
        let mut inner = self.lock();
        Arc::clone(
            inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Discards any existing entry for `key` and installs a fresh zero cell
    ///
    /// Used when a path is known to name a brand-new file, so stale offsets
    /// from a prior incarnation cannot skip its content.
    pub fn replace(&self, key: &FollowerKey) -> OffsetCell {
        let cell: OffsetCell = Arc::new(AtomicU64::new(0));
        self.lock().entries.insert(key.clone(), Arc::clone(&cell));
        cell
    }

    /// Returns the cell for `key` if present; never allocates
    pub fn lookup(&self, key: &FollowerKey) -> Option<OffsetCell> {
        self.lock().entries.get(key).map(Arc::clone)
    }

    /// Purges the entry for `key`
    pub fn remove(&self, key: &FollowerKey) {
        self.lock().entries.remove(key);
    }

    /// Moves the cell under `old` to `new`, preserving its value
    ///
    /// Installs a fresh zero cell if `old` has no entry. Used when a
    /// follower's key is reassigned by a rename.
    pub fn rename_key(&self, old: &FollowerKey, new: FollowerKey) -> OffsetCell {
        let mut inner = self.lock();
        let cell = inner
            .entries
            .remove(old)
            .unwrap_or_else(|| Arc::new(AtomicU64::new(0)));
        inner.entries.insert(new, Arc::clone(&cell));
        cell
    }

    /// Atomically rewrites the on-disk image
    ///
    /// Concurrent flushes are serialized by the store's lock. A flush that
    /// fails mid-write is reported to the caller; the next flush attempts a
    /// full rewrite again.
    pub fn flush(&self) -> Result<()> {
        let inner = self.lock();
        if inner.closed {
            return Err(FollowError::NotReady);
        }
        write_image(&inner.path, &inner.entries)
    }

    /// Flushes and releases the store; later operations fail `NotReady`
    ///
    /// Idempotent: a second close is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        let res = write_image(&inner.path, &inner.entries);
        inner.closed = true;
        res
    }

    /// Number of entries currently held (live and orphaned)
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True iff the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current map, for introspection and tests
    pub fn snapshot(&self) -> Vec<(FollowerKey, u64)> {
        let inner = self.lock();
        let mut out: Vec<_> = inner
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Acquire)))
            .collect();
        out.sort();
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Image encode / decode
// ============================================================================

/// Decodes and repairs an existing image.
///
/// A corrupt or unrecognised image yields the empty map: offsets restart
/// from zero, which duplicates data rather than losing it.
fn load_image(path: &Path) -> Result<HashMap<FollowerKey, OffsetCell>> {
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Ok(HashMap::new());
    }

    let image: StateImage = match serde_json::from_slice(&bytes) {
        Ok(image) => image,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt state image, starting empty");
            return Ok(HashMap::new());
        }
    };
    if image.version != STATE_FORMAT_VERSION {
        warn!(
            path = %path.display(),
            version = image.version,
            "Unknown state image version, starting empty"
        );
        return Ok(HashMap::new());
    }

    let mut entries = HashMap::new();
    for entry in image.entries {
        let size = match std::fs::metadata(&entry.path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                debug!(path = %entry.path.display(), "Pruning state for vanished file");
                continue;
            }
        };
        let offset = if entry.offset > size {
            debug!(
                path = %entry.path.display(),
                stored = entry.offset,
                size,
                "Stored offset beyond current size, resetting to zero"
            );
            0
        } else {
            entry.offset
        };
        entries.insert(
            FollowerKey::new(entry.config, entry.path),
            Arc::new(AtomicU64::new(offset)),
        );
    }
    Ok(entries)
}

/// Serializes the map and atomically replaces the target file.
fn write_image(path: &Path, entries: &HashMap<FollowerKey, OffsetCell>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut list: Vec<StateEntry> = entries
        .iter()
        .map(|(key, cell)| StateEntry {
            config: key.config_name.clone(),
            path: key.path.clone(),
            offset: cell.load(Ordering::Acquire),
        })
        .collect();
    list.sort_by(|a, b| (&a.config, &a.path).cmp(&(&b.config, &b.path)));

    let image = StateImage {
        version: STATE_FORMAT_VERSION,
        entries: list,
    };
    let encoded = serde_json::to_vec_pretty(&image)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    // Write to a sibling temporary so the rename is atomic (same filesystem).
    let tmp_path = {
        let mut p = path.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    };
    std::fs::write(&tmp_path, &encoded)?;
    std::fs::rename(&tmp_path, path)?;

    debug!(path = %path.display(), entries = image.entries.len(), "State flushed");
    Ok(())
}

// ============================================================================
// Unit tests
// ============================================================================
