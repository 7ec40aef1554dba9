//! Filter manager
//!
//! The [`FilterManager`] is the central data structure of the follower
//! core. It owns the installed [`FilterSpec`]s, the map from
//! [`FollowerKey`] to live [`Follower`], the [`StateStore`] and the
//! maximum-live-followers cap.
//!
//! Every public operation takes the manager's one exclusive lock.
//! Filesystem calls (stat, readdir) happen under that lock: they are
//! fast-path, and releasing the lock around them would admit TOCTOU races
//! against concurrent rename and remove events.
//!
//! ## Rotation handling
//!
//! Two complementary mechanisms recognise renames by [`FileIdentity`]:
//!
//! - [`check_rename`](FilterManager) runs at the front of the launch
//!   algorithm: a "new" path whose identity matches a live follower is a
//!   rename destination, and the follower is re-keyed instead of replaced.
//! - [`rename_follower`](FilterManager::rename_follower) runs on rename
//!   events naming the old path: the identity is searched for under every
//!   installed filter's directory to find where the file went.
//!
//! Both preserve the offset cell, so bytes already shipped are never
//! re-read across a rotation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logdrift_core::domain::{FileIdentity, FilterSpec, FollowerKey};

use crate::error::{FollowError, Result};
use crate::follower::Follower;
use crate::state::StateStore;

// ============================================================================
// FilterManager
// ============================================================================

/// Owns filters, followers and state; dispatches paths to followers
pub struct FilterManager {
    inner: Mutex<Inner>,
    store: StateStore,
    max_followers: usize,
}

struct Inner {
    filters: Vec<FilterSpec>,
    followers: HashMap<FollowerKey, Arc<Follower>>,
    closed: bool,
}

impl FilterManager {
    /// Creates a manager over `store` with the given live-follower cap
    ///
    /// A `max_followers` of zero disables the cap.
    pub fn new(store: StateStore, max_followers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                filters: Vec::new(),
                followers: HashMap::new(),
                closed: false,
            }),
            store,
            max_followers,
        }
    }

    /// The underlying state store, for flushing and introspection
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ========================================================================
    // Filter installation
    // ========================================================================

    /// Installs a filter spec; exact duplicates are collapsed
    pub async fn add_filter(&self, spec: FilterSpec) {
        let mut inner = self.inner.lock().await;
        if inner.filters.contains(&spec) {
            debug!(
                config = spec.config_name(),
                dir = %spec.base_dir().display(),
                "Duplicate filter spec ignored"
            );
            return;
        }
        info!(
            config = spec.config_name(),
            dir = %spec.base_dir().display(),
            patterns = spec.raw_patterns(),
            recursive = spec.recursive(),
            "Filter installed"
        );
        inner.filters.push(spec);
    }

    /// Number of installed filters
    pub async fn filter_count(&self) -> usize {
        self.inner.lock().await.filters.len()
    }

    /// Number of live followers
    pub async fn follower_count(&self) -> usize {
        self.inner.lock().await.followers.len()
    }

    /// True iff any live follower exists for `path` under any filter
    pub async fn is_watched(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .await
            .followers
            .keys()
            .any(|k| k.path == path)
    }

    // ========================================================================
    // Follower lifecycle
    // ========================================================================

    /// Treats `path` as a newly created file and starts matching followers
    ///
    /// Any state stored for the path belongs to a prior incarnation and is
    /// purged, so the new file is read from offset zero.
    pub async fn new_follower(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(FollowError::NotReady);
        }
        self.launch_followers(&mut inner, path, true).await?;
        Ok(())
    }

    /// Starts followers for `path`, resuming from any persisted offset
    ///
    /// Used for startup enumeration and for write events on paths that are
    /// not yet watched (a write can outrun delivery of its create event).
    pub async fn load_file(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(FollowError::NotReady);
        }
        self.launch_followers(&mut inner, path, false).await?;
        Ok(())
    }

    /// Forwards a write signal to every live follower for `path`
    ///
    /// Returns false when no follower is watching the path; the caller then
    /// treats the write as a create race and loads the file.
    pub async fn signal_write(&self, path: &Path) -> bool {
        let inner = self.inner.lock().await;
        let mut any = false;
        for (key, follower) in &inner.followers {
            if key.path == path {
                follower.signal_write();
                any = true;
            }
        }
        any
    }

    /// Closes every follower for `path` across all filters
    ///
    /// When `purge` is set the offset cells are removed too; otherwise the
    /// state survives for a later re-appearance of the file.
    pub async fn remove_follower(&self, path: &Path, purge: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<FollowerKey> = inner
            .followers
            .keys()
            .filter(|k| k.path == path)
            .cloned()
            .collect();
        for key in keys {
            if let Some(follower) = inner.followers.remove(&key) {
                info!(key = %key, purge, "Closing follower for removed file");
                if let Err(e) = follower.retire().await {
                    warn!(key = %key, error = %e, "Error closing follower");
                }
            }
            if purge {
                self.store.remove(&key);
            }
        }
        Ok(())
    }

    /// Closes every follower whose path is under `dir`
    pub async fn remove_directory(&self, dir: &Path, purge: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<FollowerKey> = inner
            .followers
            .keys()
            .filter(|k| k.path.starts_with(dir))
            .cloned()
            .collect();
        for key in keys {
            if let Some(follower) = inner.followers.remove(&key) {
                info!(key = %key, purge, "Closing follower under removed directory");
                if let Err(e) = follower.close().await {
                    warn!(key = %key, error = %e, "Error closing follower");
                }
            }
            if purge {
                self.store.remove(&key);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Launch algorithm
    // ========================================================================

    /// Resolves `path` against the installed filters and starts followers
    ///
    /// Returns true if the event turned out to be a pure rename of an
    /// already-live follower (in which case nothing new was started).
    async fn launch_followers(
        &self,
        inner: &mut Inner,
        path: &Path,
        purge_existing_state: bool,
    ) -> Result<bool> {
        let identity = match FileIdentity::of_path(path) {
            Ok(identity) => identity,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Vanished between the event and now; nothing to start.
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if self.check_rename(inner, path, identity).await? {
            return Ok(true);
        }

        let Some(dir) = path.parent() else {
            return Ok(false);
        };
        let Some(base) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(false);
        };

        for index in 0..inner.filters.len() {
            let spec = inner.filters[index].clone();
            if spec.base_dir() != dir || !spec.matches_name(base) {
                continue;
            }

            let key = spec.key_for(path);

            // The existing-follower check runs before the cell is touched:
            // a duplicate create for a file already followed at this
            // identity must not zero the live offset.
            if let Some(existing) = inner.followers.get(&key) {
                if existing.file_identity() == identity {
                    continue;
                }
                if let Some(stale) = inner.followers.remove(&key) {
                    debug!(key = %key, "Replacing follower whose identity changed");
                    if let Err(e) = stale.close().await {
                        warn!(key = %key, error = %e, "Error closing stale follower");
                    }
                }
            }

            let cell = if purge_existing_state {
                self.store.replace(&key)
            } else {
                self.store.get_or_create(&key)
            };

            self.expunge_old_files(inner).await;

            match Follower::open(key.clone(), index, spec.engine(), cell, spec.handler()).await {
                Ok(follower) => {
                    follower.start()?;
                    info!(key = %key, "Follower started");
                    inner.followers.insert(key, follower);
                }
                Err(FollowError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(key = %key, "File vanished before open");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(false)
    }

    /// Recognises `path` as the new name of an already-live follower
    ///
    /// For each live follower whose identity equals the one just stat-ed:
    /// if the path still matches the follower's owning filter, the follower
    /// is re-keyed (a pure rename); otherwise the rename moved the file out
    /// of the filter's set and the follower is closed with its state purged.
    async fn check_rename(
        &self,
        inner: &mut Inner,
        path: &Path,
        identity: FileIdentity,
    ) -> Result<bool> {
        let candidates: Vec<FollowerKey> = inner
            .followers
            .iter()
            .filter(|(_, f)| f.file_identity() == identity)
            .map(|(k, _)| k.clone())
            .collect();

        let mut renamed = false;
        for old_key in candidates {
            let filter_index = match inner.followers.get(&old_key) {
                Some(follower) => follower.filter_index(),
                None => continue,
            };

            let Some(spec) = inner.filters.get(filter_index).cloned() else {
                // The owning filter is gone; the follower cannot be
                // reclassified.
                if let Some(follower) = inner.followers.remove(&old_key) {
                    warn!(key = %old_key, "Follower's filter index out of range, closing");
                    if let Err(e) = follower.close().await {
                        warn!(key = %old_key, error = %e, "Error closing follower");
                    }
                }
                self.store.remove(&old_key);
                continue;
            };

            if spec.matches_path(path) {
                if old_key.path != path {
                    if let Some(follower) = inner.followers.remove(&old_key) {
                        let new_key = FollowerKey::new(old_key.config_name.clone(), path);
                        info!(old = %old_key, new = %new_key, "Rename detected, re-keying follower");
                        self.store.rename_key(&old_key, new_key.clone());
                        follower.set_path(path.to_path_buf());
                        inner.followers.insert(new_key, follower);
                        renamed = true;
                    }
                }
                // Same path, same identity: nothing moved.
            } else {
                // The rename took the file out of the filter's set.
                if let Some(follower) = inner.followers.remove(&old_key) {
                    info!(key = %old_key, new_path = %path.display(), "Renamed out of filter, closing follower");
                    if let Err(e) = follower.close().await {
                        warn!(key = %old_key, error = %e, "Error closing follower");
                    }
                }
                self.store.remove(&old_key);
            }
        }
        Ok(renamed)
    }

    /// Handles a rename event naming the old path
    ///
    /// Scans every installed filter's directory for the follower's identity
    /// to find the destination. Three outcomes: re-key under the same
    /// filter, migrate to a different filter (offset preserved), or close
    /// and purge when the file left every filter's set.
    pub async fn rename_follower(&self, old_path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(FollowError::NotReady);
        }

        let keys: Vec<FollowerKey> = inner
            .followers
            .keys()
            .filter(|k| k.path == old_path)
            .cloned()
            .collect();

        for old_key in keys {
            let (identity, old_index) = match inner.followers.get(&old_key) {
                Some(follower) => (follower.file_identity(), follower.filter_index()),
                None => continue,
            };

            match locate_identity(&inner.filters, identity) {
                Some((index, new_path)) if index == old_index => {
                    // Still ours, just under a new name.
                    if let Some(follower) = inner.followers.remove(&old_key) {
                        let new_key = FollowerKey::new(old_key.config_name.clone(), &new_path);
                        info!(old = %old_key, new = %new_key, "Follower renamed within filter");
                        self.store.rename_key(&old_key, new_key.clone());
                        follower.set_path(new_path);
                        inner.followers.insert(new_key, follower);
                    }
                }
                Some((index, new_path)) => {
                    // Moved into a different filter's set; restart there
                    // with the preserved offset so shipped bytes are not
                    // re-read.
                    if let Some(follower) = inner.followers.remove(&old_key) {
                        if let Err(e) = follower.close().await {
                            warn!(key = %old_key, error = %e, "Error closing follower");
                        }
                    }
                    let spec = inner.filters[index].clone();
                    let new_key = spec.key_for(&new_path);
                    info!(old = %old_key, new = %new_key, "Follower migrated to a different filter");
                    let cell = self.store.rename_key(&old_key, new_key.clone());
                    match Follower::open(new_key.clone(), index, spec.engine(), cell, spec.handler())
                        .await
                    {
                        Ok(follower) => {
                            follower.start()?;
                            inner.followers.insert(new_key, follower);
                        }
                        Err(FollowError::Io(e))
                            if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    // Gone from every filter's set.
                    if let Some(follower) = inner.followers.remove(&old_key) {
                        info!(key = %old_key, "Renamed away from all filters, closing follower");
                        if let Err(e) = follower.close().await {
                            warn!(key = %old_key, error = %e, "Error closing follower");
                        }
                    }
                    self.store.remove(&old_key);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Capacity enforcement
    // ========================================================================

    /// Evicts the most idle followers until strictly below the cap
    ///
    /// Evicted followers keep their state-store entries, so a later write
    /// to the file resumes at the persisted offset.
    async fn expunge_old_files(&self, inner: &mut Inner) {
        if self.max_followers == 0 {
            return;
        }
        while inner.followers.len() >= self.max_followers {
            // Largest idle duration wins; equal idleness falls back to key
            // order so eviction is deterministic.
            let victim = inner
                .followers
                .iter()
                .map(|(key, follower)| (follower.idle_duration(), key.clone()))
                .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
            let Some((idle, key)) = victim else { break };
            if let Some(follower) = inner.followers.remove(&key) {
                info!(
                    key = %key,
                    idle_secs = idle.as_secs(),
                    "Live follower cap reached, evicting most idle follower"
                );
                if let Err(e) = follower.close().await {
                    warn!(key = %key, error = %e, "Error closing evicted follower");
                }
            }
        }
    }

    // ========================================================================
    // Catch-up, flush, close
    // ========================================================================

    /// Synchronously drains `path` to EOF for every matching filter
    ///
    /// Used at startup before live following begins. Returns true if the
    /// cancellation source fired mid-file.
    pub async fn catchup_file(&self, path: &Path, cancel: &CancellationToken) -> Result<bool> {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Err(FollowError::NotReady);
        }
        let Some(dir) = path.parent() else {
            return Ok(false);
        };
        let Some(base) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(false);
        };

        for index in 0..inner.filters.len() {
            let spec = inner.filters[index].clone();
            if spec.base_dir() != dir || !spec.matches_name(base) {
                continue;
            }
            let key = spec.key_for(path);
            let cell = self.store.get_or_create(&key);
            let follower =
                match Follower::open(key.clone(), index, spec.engine(), cell, spec.handler()).await
                {
                    Ok(follower) => follower,
                    Err(FollowError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        continue;
                    }
                    Err(e) => return Err(e),
                };
            let result = follower.sync(cancel).await;
            if let Err(e) = follower.close().await {
                warn!(key = %key, error = %e, "Error closing catch-up follower");
            }
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Persists all offsets via the state store
    pub fn flush_states(&self) -> Result<()> {
        self.store.flush()
    }

    /// Closes all followers and the state store
    ///
    /// Every component is given the chance to release resources; the first
    /// error encountered is returned after the rest are logged.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        let mut first_err: Option<FollowError> = None;
        let keys: Vec<FollowerKey> = inner.followers.keys().cloned().collect();
        for key in keys {
            if let Some(follower) = inner.followers.remove(&key) {
                if let Err(e) = follower.close().await {
                    warn!(key = %key, error = %e, "Error closing follower");
                    first_err.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.store.close() {
            warn!(error = %e, "Error closing state store");
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Identity search
// ============================================================================

/// Walks every filter's directory looking for a file with `identity`
///
/// Returns the first `(filter_index, path)` found, scanning filters in
/// index order.
fn locate_identity(filters: &[FilterSpec], identity: FileIdentity) -> Option<(usize, PathBuf)> {
    for (index, spec) in filters.iter().enumerate() {
        let entries = match std::fs::read_dir(spec.base_dir()) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !spec.matches_name(name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            if FileIdentity::from_metadata(&meta) == identity {
                return Some((index, path));
            }
        }
    }
    None
}

// ============================================================================
// Unit tests
// ============================================================================
