//! Watch manager and event loop
//!
//! The [`WatchManager`] wraps the `notify` crate to monitor the configured
//! directories, converting raw OS events into internal [`FsEvent`] values
//! that drive the [`FilterManager`]. One OS watcher serves every directory;
//! its callback runs on the watcher's thread and forwards events and errors
//! over two mpsc channels into the tokio event loop.
//!
//! ## Architecture
//!
//! ```text
//! inotify
//!    │
//!    ▼
//! notify callback ──→ event channel ──→ event loop ──→ FilterManager
//!                 └──→ error channel ──┘   │
//!                                          ├─ 60 s state flush tick
//!                                          └─ 10 s removed-directory recheck
//! ```
//!
//! Directories live in one of two disjoint sets: **watched** (an OS watch
//! is installed) or **removed** (the directory disappeared, or never
//! existed, and the recheck tick waits for it to appear). Kernel
//! event-queue overflow travels the error channel as
//! [`FollowError::KernelQueueOverflow`] and is reported with its
//! remediation hint; it never tears the loop down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use logdrift_core::domain::FilterSpec;

use crate::error::{FollowError, Result};
use crate::manager::FilterManager;

/// Cadence of the periodic offset flush
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the removed-directory re-appearance check
const RECHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Depth of the event and error channels
const CHANNEL_DEPTH: usize = 1024;

// ============================================================================
// Internal event representation
// ============================================================================

/// Filesystem events the loop dispatches, decoupled from notify's types
#[derive(Debug, Clone, PartialEq, Eq)]
enum FsEvent {
    /// A new entry (file or directory) appeared at the path
    Create(PathBuf),
    /// An existing entry's content changed
    Write(PathBuf),
    /// The entry (or its parent link) was deleted
    Remove(PathBuf),
    /// The entry was renamed away; the path is the OLD name
    Rename(PathBuf),
}

/// Converts a `notify::Event` into zero or more internal events
///
/// Rename handling maps the OLD path to [`FsEvent::Rename`] and the NEW
/// path to [`FsEvent::Create`]; identity matching downstream recognises the
/// create as a rename destination, so both halves work even when the
/// backend fails to pair them.
fn map_notify_event(event: &notify::Event) -> Vec<FsEvent> {
    let Some(first) = event.paths.first() else {
        return Vec::new();
    };

    match &event.kind {
        EventKind::Create(_) => vec![FsEvent::Create(first.clone())],

        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            vec![FsEvent::Write(first.clone())]
        }

        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => vec![FsEvent::Rename(first.clone())],
            RenameMode::To => vec![FsEvent::Create(first.clone())],
            RenameMode::Both if event.paths.len() >= 2 => vec![
                FsEvent::Rename(first.clone()),
                FsEvent::Create(event.paths[1].clone()),
            ],
            _ => vec![FsEvent::Rename(first.clone())],
        },

        EventKind::Remove(_) => vec![FsEvent::Remove(first.clone())],

        // Access and metadata-only events carry no new bytes.
        _ => Vec::new(),
    }
}

// ============================================================================
// WatchManager
// ============================================================================

/// Owns OS directory watches and the event loop that drives the filters
pub struct WatchManager {
    filters: Arc<FilterManager>,
    shared: Arc<Mutex<WatchShared>>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct WatchShared {
    /// The one OS watcher shared by all directories; dropped on close
    watcher: Option<RecommendedWatcher>,
    /// Directories with an installed OS watch, and their specs
    watched: HashMap<PathBuf, Vec<FilterSpec>>,
    /// Directories awaiting re-appearance, and their specs
    removed: HashMap<PathBuf, Vec<FilterSpec>>,
    /// Receivers parked here until `start` hands them to the loop
    event_rx: Option<mpsc::Receiver<FsEvent>>,
    err_rx: Option<mpsc::Receiver<FollowError>>,
    started: bool,
    caught_up: bool,
    closed: bool,
}

impl WatchManager {
    /// Creates the manager and its OS watcher
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    /// (e.g. the inotify instance limit is reached).
    pub fn new(filters: Arc<FilterManager>) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel::<FsEvent>(CHANNEL_DEPTH);
        let (err_tx, err_rx) = mpsc::channel::<FollowError>(CHANNEL_DEPTH);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if event.need_rescan() {
                        let _ = err_tx.blocking_send(FollowError::KernelQueueOverflow);
                    }
                    for mapped in map_notify_event(&event) {
                        if event_tx.blocking_send(mapped).is_err() {
                            // Receiver dropped: the loop is shutting down.
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = err_tx.blocking_send(FollowError::Notify(err));
                }
            },
            notify::Config::default(),
        )?;

        Ok(Self {
            filters,
            shared: Arc::new(Mutex::new(WatchShared {
                watcher: Some(watcher),
                watched: HashMap::new(),
                removed: HashMap::new(),
                event_rx: Some(event_rx),
                err_rx: Some(err_rx),
                started: false,
                caught_up: false,
                closed: false,
            })),
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        })
    }

    /// The filter manager this watcher drives
    pub fn filter_manager(&self) -> &Arc<FilterManager> {
        &self.filters
    }

    // ========================================================================
    // Directory lifecycle
    // ========================================================================

    /// Admits a filter spec and installs watches for its directory tree
    ///
    /// A missing directory is admitted into the removed set and picked up
    /// by the recheck tick once it appears. A recursive spec fans out over
    /// existing subdirectories, and existing regular files are loaded into
    /// the filter manager.
    ///
    /// # Errors
    /// [`FollowError::LocationNotDir`] if the path exists but is not a
    /// directory; I/O errors from enumeration.
    pub async fn add(&self, spec: FilterSpec) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(FollowError::NotReady);
        }
        install_spec(&mut shared, &self.filters, spec).await
    }

    /// Moves a watched directory into the removed set
    ///
    /// The OS watch is dropped and every follower under the directory is
    /// closed WITHOUT purging state, so offsets survive a re-appearance.
    pub async fn remove(&self, dir: &Path) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(FollowError::NotReady);
        }
        remove_dir_locked(&mut shared, &self.filters, dir).await
    }

    /// Re-installs a removed directory if it exists again
    pub async fn check_new_directory(&self, dir: &Path) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(FollowError::NotReady);
        }
        check_new_directory_locked(&mut shared, &self.filters, dir).await
    }

    /// Number of directories currently watched
    pub async fn watched_count(&self) -> usize {
        self.shared.lock().await.watched.len()
    }

    /// Number of directories awaiting re-appearance
    pub async fn removed_count(&self) -> usize {
        self.shared.lock().await.removed.len()
    }

    // ========================================================================
    // Start / catch-up
    // ========================================================================

    /// Enumerates pre-existing files and spawns the event loop
    ///
    /// # Errors
    /// [`FollowError::NoDirectories`] when nothing is watched or pending;
    /// [`FollowError::AlreadyStarted`] on a second start.
    pub async fn start(&self) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(FollowError::NotReady);
        }
        if shared.started {
            return Err(FollowError::AlreadyStarted);
        }
        if shared.watched.is_empty() && shared.removed.is_empty() {
            return Err(FollowError::NoDirectories);
        }
        shared.started = true;

        // Load whatever already exists, oldest modification first.
        for path in enumerate_sorted(&shared.watched) {
            if let Err(e) = self.filters.load_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to load pre-existing file");
            }
        }

        let event_rx = shared.event_rx.take().ok_or(FollowError::NotReady)?;
        let err_rx = shared.err_rx.take().ok_or(FollowError::NotReady)?;

        let handle = tokio::spawn(event_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.filters),
            self.cancel.clone(),
            event_rx,
            err_rx,
        ));
        *self.lock_task() = Some(handle);

        info!("Watch manager started");
        Ok(())
    }

    /// Synchronously drains every pre-existing file before live following
    ///
    /// Aborts between files (never mid-record) when `quit` fires. Must run
    /// before [`start`](Self::start).
    ///
    /// # Errors
    /// [`FollowError::AlreadyStarted`] on a second catch-up or after start.
    pub async fn catchup(&self, quit: &CancellationToken) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(FollowError::NotReady);
        }
        if shared.started || shared.caught_up {
            return Err(FollowError::AlreadyStarted);
        }
        shared.caught_up = true;

        for path in enumerate_sorted(&shared.watched) {
            if quit.is_cancelled() {
                info!("Catch-up aborted by quit signal");
                break;
            }
            match self.filters.catchup_file(&path, quit).await {
                Ok(false) => {}
                Ok(true) => {
                    info!("Catch-up aborted by quit signal");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops the event loop, releases the OS watcher and closes the filters
    ///
    /// Events already received are drained before the loop stops; events
    /// arriving afterwards are discarded. Errors are aggregated so every
    /// component gets the chance to release resources.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.lock_task().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Watch event loop join failed");
            }
        }

        {
            let mut shared = self.shared.lock().await;
            if shared.closed {
                return Ok(());
            }
            shared.closed = true;
            // Dropping the watcher releases every OS watch at once.
            shared.watcher = None;
        }

        self.filters.close().await
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Locked helpers (shared by public API and the event loop)
// ============================================================================

/// Installs `spec` and, recursively, clones of it for subdirectories
///
/// Uses a work queue rather than recursion so the borrow of the shared
/// state stays simple.
async fn install_spec(
    shared: &mut WatchShared,
    filters: &FilterManager,
    spec: FilterSpec,
) -> Result<()> {
    let mut queue = vec![spec];
    while let Some(spec) = queue.pop() {
        let dir = spec.base_dir().to_path_buf();

        match std::fs::metadata(&dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(dir = %dir.display(), "Directory missing, waiting for it to appear");
                let entry = shared.removed.entry(dir).or_default();
                if !entry.contains(&spec) {
                    entry.push(spec);
                }
                continue;
            }
            Err(e) => return Err(e.into()),
            Ok(meta) if !meta.is_dir() => return Err(FollowError::LocationNotDir(dir)),
            Ok(_) => {}
        }

        if !shared.watched.contains_key(&dir) {
            if let Some(watcher) = shared.watcher.as_mut() {
                watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            }
            debug!(dir = %dir.display(), "OS watch installed");
        }
        let specs = shared.watched.entry(dir.clone()).or_default();
        if specs.contains(&spec) {
            continue;
        }
        specs.push(spec.clone());
        filters.add_filter(spec.clone()).await;

        if spec.recursive() {
            let entries = std::fs::read_dir(&dir)?;
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(meta) = entry.metadata() else { continue };
                if meta.is_dir() {
                    queue.push(spec.with_base_dir(&path));
                } else if meta.is_file() {
                    if let Err(e) = filters.load_file(&path).await {
                        warn!(path = %path.display(), error = %e, "Failed to load existing file");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Moves `dir` from the watched set to the removed set, if watched
async fn remove_dir_locked(
    shared: &mut WatchShared,
    filters: &FilterManager,
    dir: &Path,
) -> Result<()> {
    let Some(specs) = shared.watched.remove(dir) else {
        return Ok(());
    };
    info!(dir = %dir.display(), "Directory gone, moving to removed set");

    if let Some(watcher) = shared.watcher.as_mut() {
        if let Err(e) = watcher.unwatch(dir) {
            // The kernel usually dropped the watch with the directory.
            debug!(dir = %dir.display(), error = %e, "Unwatch failed");
        }
    }

    let entry = shared.removed.entry(dir.to_path_buf()).or_default();
    for spec in specs {
        if !entry.contains(&spec) {
            entry.push(spec);
        }
    }

    // State survives: the directory may come back with the same files.
    filters.remove_directory(dir, false).await
}

/// Re-installs a removed directory that exists again
async fn check_new_directory_locked(
    shared: &mut WatchShared,
    filters: &FilterManager,
    dir: &Path,
) -> Result<()> {
    if !shared.removed.contains_key(dir) {
        return Ok(());
    }
    let is_dir = std::fs::metadata(dir).map(|m| m.is_dir()).unwrap_or(false);
    if !is_dir {
        return Ok(());
    }

    info!(dir = %dir.display(), "Directory re-appeared, re-installing specs");
    let specs = shared.removed.remove(dir).unwrap_or_default();
    for spec in specs {
        install_spec(shared, filters, spec).await?;
    }

    // Pick up whatever files the directory came back with.
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let is_file = entry.metadata().map(|m| m.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let path = entry.path();
            if let Err(e) = filters.load_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to load re-appeared file");
            }
        }
    }
    Ok(())
}

/// All regular files in the watched directories, oldest modification first
fn enumerate_sorted(watched: &HashMap<PathBuf, Vec<FilterSpec>>) -> Vec<PathBuf> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for dir in watched.keys() {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, entry.path()));
        }
    }
    files.sort();
    files.into_iter().map(|(_, path)| path).collect()
}

// ============================================================================
// Event loop
// ============================================================================

async fn event_loop(
    shared: Arc<Mutex<WatchShared>>,
    filters: Arc<FilterManager>,
    cancel: CancellationToken,
    mut event_rx: mpsc::Receiver<FsEvent>,
    mut err_rx: mpsc::Receiver<FollowError>,
) {
    let mut flush_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + FLUSH_INTERVAL,
        FLUSH_INTERVAL,
    );
    let mut recheck_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + RECHECK_INTERVAL,
        RECHECK_INTERVAL,
    );

    info!("Watch event loop running");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Drain events already received, then stop; later arrivals
                // are discarded.
                while let Ok(event) = event_rx.try_recv() {
                    handle_event(&shared, &filters, event).await;
                }
                break;
            }

            event = event_rx.recv() => match event {
                Some(event) => handle_event(&shared, &filters, event).await,
                None => {
                    info!("Event channel closed, watch loop shutting down");
                    break;
                }
            },

            err = err_rx.recv() => match err {
                // Overflow carries its remediation hint in the error's
                // Display; it is reported, never fatal.
                Some(err @ FollowError::KernelQueueOverflow) => {
                    error!(error = %err, "Filesystem events were dropped");
                }
                Some(err) => {
                    warn!(error = %err, "Watch backend error");
                }
                None => {
                    info!("Error channel closed, watch loop shutting down");
                    break;
                }
            },

            _ = flush_tick.tick() => {
                if let Err(e) = filters.flush_states() {
                    warn!(error = %e, "Periodic state flush failed");
                }
            }

            _ = recheck_tick.tick() => {
                recheck_removed(&shared, &filters).await;
            }
        }
    }
    info!("Watch event loop stopped");
}

async fn handle_event(shared: &Mutex<WatchShared>, filters: &FilterManager, event: FsEvent) {
    debug!(event = ?event, "Dispatching filesystem event");
    match event {
        FsEvent::Create(path) => {
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(_) => return, // vanished again already
            };
            if meta.is_dir() {
                let Some(parent) = path.parent().map(Path::to_path_buf) else {
                    return;
                };
                let mut guard = shared.lock().await;
                let specs: Vec<FilterSpec> = guard
                    .watched
                    .get(&parent)
                    .map(|specs| {
                        specs
                            .iter()
                            .filter(|spec| spec.recursive())
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                for spec in specs {
                    if let Err(e) = install_spec(&mut guard, filters, spec.with_base_dir(&path)).await
                    {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to extend watch to new subdirectory"
                        );
                    }
                }
            } else if meta.is_file() {
                if let Err(e) = filters.new_follower(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to start follower");
                }
            }
        }

        FsEvent::Write(path) => {
            // A watched path's follower gets a signal; an unknown path is a
            // create whose notification lost the race with the write.
            if !filters.signal_write(&path).await {
                if let Err(e) = filters.load_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to load written file");
                }
            }
        }

        FsEvent::Remove(path) => {
            {
                let mut guard = shared.lock().await;
                if let Err(e) = remove_dir_locked(&mut guard, filters, &path).await {
                    warn!(path = %path.display(), error = %e, "Failed to retire directory");
                }
            }
            if let Err(e) = filters.remove_follower(&path, true).await {
                warn!(path = %path.display(), error = %e, "Failed to remove follower");
            }
        }

        FsEvent::Rename(path) => {
            if let Err(e) = filters.rename_follower(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to handle rename");
            }
        }
    }
}

async fn recheck_removed(shared: &Mutex<WatchShared>, filters: &FilterManager) {
    let dirs: Vec<PathBuf> = shared.lock().await.removed.keys().cloned().collect();
    for dir in dirs {
        let is_dir = std::fs::metadata(&dir).map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let mut guard = shared.lock().await;
        if let Err(e) = check_new_directory_locked(&mut guard, filters, &dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to re-install directory");
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
