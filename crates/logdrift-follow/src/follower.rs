//! Per-file follower
//!
//! A [`Follower`] binds one open file handle to a record-extraction engine,
//! an offset cell in the state store and a [`Handler`]. It runs in one of
//! two modes:
//!
//! - **Live** ([`start`](Follower::start)): a background task owns the
//!   handle and selects on the follower's internal per-file event
//!   subscription, a one-second tick and an abort token, streaming records
//!   as the file grows and surviving truncation.
//! - **Catch-up** ([`sync`](Follower::sync)): reads records to EOF on the
//!   caller's task, checking a cancellation source after each emitted
//!   record. Used at startup before live following begins.
//!
//! The per-file subscription is internal: the filter manager signals write
//! and remove events for the follower's path out of the shared directory
//! watch (one OS watcher per manager). The periodic tick re-reads
//! regardless, so a missed or dropped signal delays data by at most one
//! tick.
//!
//! The offset cell is advanced strictly after a successful handler call,
//! never before, so a crash or handler failure re-delivers rather than
//! drops.
//!
//! The handle is opened read-only; on POSIX it stays readable through
//! subsequent rename and unlink, which is what lets a follower drain a
//! rotated file.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logdrift_core::domain::{EngineParams, FileIdentity, FollowerKey};
use logdrift_core::ports::Handler;

use crate::engine::{build_engine, Record, RecordEngine};
use crate::error::{is_vanished, FollowError, Result};
use crate::state::OffsetCell;

/// Read granularity for both modes
const READ_CHUNK: usize = 32 * 1024;

/// Cadence of the live loop's fallback read
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Idle threshold for the flush performed while closing
const CLOSING_FLUSH_AFTER: Duration = Duration::from_secs(1);

/// Depth of the internal per-file event channel
const EVENT_QUEUE_DEPTH: usize = 64;

/// Events deliverable on the internal per-file subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileEvent {
    /// Bytes may have been appended
    Write,
    /// The file (or its last link) is gone
    Removed,
}

/// Everything the reading side owns: handle, engine and event receiver.
///
/// Held by the live task while running; parked in the follower otherwise so
/// `sync` and `close` can reach it. Dropping it closes the engine.
struct Worker {
    file: File,
    engine: Box<dyn RecordEngine>,
    events: mpsc::Receiver<FileEvent>,
    /// Last instant a read returned bytes; drives the idle flush
    last_read: Instant,
}

// ============================================================================
// Follower
// ============================================================================

/// A live binding of a `(config_name, path)` key to an open file
pub struct Follower {
    config_name: String,
    /// Current path of the followed file; rebound on rename
    path: RwLock<PathBuf>,
    filter_index: usize,
    identity: FileIdentity,
    cell: OffsetCell,
    handler: Arc<dyn Handler>,
    /// Sender half of the internal per-file subscription
    events_tx: mpsc::Sender<FileEvent>,
    /// Instant of the last successful record emission
    last_activity: Mutex<Instant>,
    running: AtomicBool,
    abort: CancellationToken,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Follower {
    /// Opens `key.path` and prepares a follower bound to `cell` and `handler`
    ///
    /// Captures the file identity from the open handle, seeks to the cell's
    /// current offset (resetting to zero if the file is already shorter than
    /// the stored offset) and builds the engine. The follower is not yet
    /// reading; call [`start`](Self::start) or [`sync`](Self::sync).
    pub async fn open(
        key: FollowerKey,
        filter_index: usize,
        params: &EngineParams,
        cell: OffsetCell,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<Self>> {
        let mut file = File::open(&key.path).await?;
        let meta = file.metadata().await?;
        let identity = FileIdentity::from_metadata(&meta);

        let mut offset = cell.load(Ordering::Acquire);
        if offset > meta.len() {
            debug!(
                path = %key.path.display(),
                stored = offset,
                size = meta.len(),
                "Stored offset beyond current size, resetting to zero"
            );
            cell.store(0, Ordering::Release);
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let engine = build_engine(params, offset)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        debug!(
            path = %key.path.display(),
            identity = %identity,
            offset,
            "Follower opened"
        );

        Ok(Arc::new(Self {
            config_name: key.config_name,
            path: RwLock::new(key.path),
            filter_index,
            identity,
            cell,
            handler,
            events_tx,
            last_activity: Mutex::new(Instant::now()),
            running: AtomicBool::new(false),
            abort: CancellationToken::new(),
            worker: Mutex::new(Some(Worker {
                file,
                engine,
                events: events_rx,
                last_read: Instant::now(),
            })),
            task: Mutex::new(None),
        }))
    }

    // ========================================================================
    // Live mode
    // ========================================================================

    /// Launches the background task that follows appends live
    ///
    /// # Errors
    /// [`FollowError::AlreadyStarted`] if the follower is already running;
    /// [`FollowError::NotReady`] if it was closed.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(FollowError::AlreadyStarted);
        }
        let worker = match self.take_worker() {
            Some(worker) => worker,
            None => {
                self.running.store(false, Ordering::Release);
                return Err(FollowError::NotReady);
            }
        };
        let me = Arc::clone(self);
        let handle = tokio::spawn(me.run_live(worker));
        *self.lock_task() = Some(handle);
        Ok(())
    }

    /// Signals that bytes may have been appended to the followed path
    ///
    /// Lossy: if the queue is full the periodic tick picks the data up.
    pub fn signal_write(&self) {
        let _ = self.events_tx.try_send(FileEvent::Write);
    }

    /// Signals that the followed path was removed
    ///
    /// Returns false if the signal could not be queued; the caller should
    /// fall back to an abortive close.
    pub fn signal_removed(&self) -> bool {
        self.events_tx.try_send(FileEvent::Removed).is_ok()
    }

    async fn run_live(self: Arc<Self>, mut worker: Worker) {
        let result = self.live_loop(&mut worker).await;
        match &result {
            Ok(()) => debug!(path = %self.file_path().display(), "Follower task finished"),
            Err(e) => warn!(
                path = %self.file_path().display(),
                error = %e,
                "Follower terminated on error"
            ),
        }
        self.running.store(false, Ordering::Release);
        // Park the worker so close() releases the engine in one place.
        self.put_worker(worker);
    }

    async fn live_loop(&self, worker: &mut Worker) -> Result<()> {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Catch writes that landed between open and the first signal.
        self.read_available(worker).await?;

        loop {
            tokio::select! {
                _ = self.abort.cancelled() => {
                    // Aborted: exit without a final drain.
                    return Ok(());
                }
                event = worker.events.recv() => match event {
                    Some(FileEvent::Write) => {
                        self.read_available(worker).await?;
                    }
                    Some(FileEvent::Removed) | None => {
                        self.final_drain(worker).await?;
                        return Ok(());
                    }
                },
                _ = tick.tick() => {
                    // Covers signals that were missed or dropped.
                    self.read_available(worker).await?;
                    self.maybe_idle_flush(worker, false).await?;
                }
            }
        }
    }

    /// Reads until EOF, pushing bytes through the engine and emitting
    ///
    /// Reaching EOF with a stat size strictly below the stored offset means
    /// the file was truncated: offset and engine restart from zero.
    async fn read_available(&self, worker: &mut Worker) -> Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match worker.file.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) if is_vanished(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                let size = match worker.file.metadata().await {
                    Ok(meta) => meta.len(),
                    Err(_) => return Ok(()),
                };
                if size < self.cell.load(Ordering::Acquire) {
                    info!(
                        path = %self.file_path().display(),
                        size,
                        "Truncation detected, restarting from offset zero"
                    );
                    worker.file.seek(SeekFrom::Start(0)).await?;
                    worker.engine.reset(0);
                    self.cell.store(0, Ordering::Release);
                    continue;
                }
                return Ok(());
            }

            worker.last_read = Instant::now();
            let mut records = Vec::new();
            worker.engine.push(&chunk[..n], &mut records);
            for record in records {
                self.emit(record).await?;
            }
            // Also cover delimiter-only input that produced no records.
            self.cell
                .store(worker.engine.consumed(), Ordering::Release);
        }
    }

    /// Hands one record to the handler and advances the offset on success
    async fn emit(&self, record: Record) -> Result<()> {
        let timestamp = Utc::now();
        let path = self.file_path();
        self.handler
            .handle(&record.bytes, timestamp, &path)
            .await
            .map_err(FollowError::Handler)?;
        self.cell.store(record.offset_after, Ordering::Release);
        *self.lock_activity() = Instant::now();
        Ok(())
    }

    /// Emits buffered engine bytes if they have sat long enough
    ///
    /// This is the only way final unterminated output reaches the handler.
    async fn maybe_idle_flush(&self, worker: &mut Worker, closing: bool) -> Result<()> {
        if worker.engine.buffered() == 0 {
            return Ok(());
        }
        let flush = if closing {
            self.idle_duration() > CLOSING_FLUSH_AFTER
        } else {
            worker.last_read.elapsed() > worker.engine.idle_flush_after()
        };
        if flush {
            if let Some(record) = worker.engine.flush() {
                debug!(
                    path = %self.file_path().display(),
                    bytes = record.bytes.len(),
                    closing,
                    "Idle flush of buffered partial record"
                );
                self.emit(record).await?;
            }
        }
        Ok(())
    }

    /// One last read plus a closing flush, run when the file disappears
    async fn final_drain(&self, worker: &mut Worker) -> Result<()> {
        self.read_available(worker).await?;
        self.maybe_idle_flush(worker, true).await
    }

    // ========================================================================
    // Catch-up mode
    // ========================================================================

    /// Synchronous catch-up: reads records to EOF on the caller's task
    ///
    /// Checks `cancel` after each emitted record and returns early when it
    /// fires, reporting whether it was cancelled. Never closes the handle.
    ///
    /// # Errors
    /// [`FollowError::AlreadyStarted`] if the live task is running;
    /// [`FollowError::NotReady`] after close; handler and read errors.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<bool> {
        if self.running.load(Ordering::Acquire) {
            return Err(FollowError::AlreadyStarted);
        }
        let mut worker = self.take_worker().ok_or(FollowError::NotReady)?;
        let result = self.sync_loop(&mut worker, cancel).await;
        self.put_worker(worker);
        result
    }

    async fn sync_loop(&self, worker: &mut Worker, cancel: &CancellationToken) -> Result<bool> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match worker.file.read(&mut chunk).await {
                Ok(0) => return Ok(false),
                Ok(n) => n,
                Err(e) if is_vanished(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            worker.last_read = Instant::now();
            let mut records = Vec::new();
            worker.engine.push(&chunk[..n], &mut records);
            for record in records {
                self.emit(record).await?;
                if cancel.is_cancelled() {
                    return Ok(true);
                }
            }
            self.cell
                .store(worker.engine.consumed(), Ordering::Release);
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Cancels the background task and waits for its exit; idempotent
    pub async fn stop(&self) {
        self.abort.cancel();
        let handle = self.lock_task().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(
                    path = %self.file_path().display(),
                    error = %e,
                    "Follower task join failed"
                );
            }
        }
    }

    /// Graceful close after the followed file was removed
    ///
    /// Delivers the remove signal so the live task performs its final drain,
    /// waits for the task, then releases resources. Falls back to an
    /// abortive [`close`](Self::close) if the signal cannot be queued.
    pub async fn retire(&self) -> Result<()> {
        if self.is_running() && self.signal_removed() {
            let handle = self.lock_task().take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(
                        path = %self.file_path().display(),
                        error = %e,
                        "Follower task join failed"
                    );
                }
            }
        }
        self.close().await
    }

    /// Stops if running, then releases the engine; reports the first error
    pub async fn close(&self) -> Result<()> {
        self.stop().await;
        drop(self.take_worker());
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Monotonic time since the last successful record emission
    pub fn idle_duration(&self) -> Duration {
        self.lock_activity().elapsed()
    }

    /// Identity captured from the handle at open
    pub fn file_identity(&self) -> FileIdentity {
        self.identity
    }

    /// Index of the owning filter spec at creation time
    pub fn filter_index(&self) -> usize {
        self.filter_index
    }

    /// Current path of the followed file
    pub fn file_path(&self) -> PathBuf {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rebinds the follower to a new path after a rename
    ///
    /// The open handle tracks the inode, so only the name used for keys and
    /// record attribution changes.
    pub fn set_path(&self, path: PathBuf) {
        *self.path.write().unwrap_or_else(PoisonError::into_inner) = path;
    }

    /// The follower's config name
    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    /// Current `(config_name, path)` key
    pub fn key(&self) -> FollowerKey {
        FollowerKey::new(self.config_name.clone(), self.file_path())
    }

    /// The shared offset cell
    pub fn offset_cell(&self) -> OffsetCell {
        Arc::clone(&self.cell)
    }

    /// Current byte offset of the next unread byte
    pub fn offset(&self) -> u64 {
        self.cell.load(Ordering::Acquire)
    }

    /// Whether the live task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn take_worker(&self) -> Option<Worker> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn put_worker(&self, worker: Worker) {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_activity(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Follower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Follower")
            .field("config_name", &self.config_name)
            .field("path", &self.file_path())
            .field("filter_index", &self.filter_index)
            .field("identity", &self.identity)
            .field("offset", &self.offset())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Unit tests
// ============================================================================
