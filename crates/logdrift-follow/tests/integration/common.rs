//! Shared test helpers for the follower integration tests
//!
//! Provides a collecting [`Handler`], a fixture that wires a state store,
//! filter manager and watch manager over a temporary directory, and
//! timeout-bounded condition polling (real inotify delivery is
//! asynchronous, so every assertion waits rather than sleeps blindly).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use logdrift_core::domain::{EngineParams, FilterSpec};
use logdrift_core::ports::Handler;
use logdrift_follow::{FilterManager, StateStore, WatchManager};

/// How long assertions wait for filesystem events to propagate
pub const EVENT_DEADLINE: Duration = Duration::from_secs(15);

/// Handler that records everything it receives
pub struct CollectingHandler {
    records: Mutex<Vec<(PathBuf, Vec<u8>)>>,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    /// Every record so far as `(source, bytes)`
    pub fn records(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.records.lock().unwrap().clone()
    }

    /// Record payloads decoded as UTF-8 strings
    pub fn lines(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|(_, bytes)| String::from_utf8_lossy(&bytes).into_owned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Handler for CollectingHandler {
    async fn handle(
        &self,
        record: &[u8],
        _timestamp: DateTime<Utc>,
        source: &Path,
    ) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((source.to_path_buf(), record.to_vec()));
        Ok(())
    }
}

/// A wired-up stack over a fresh temporary directory
pub struct Fixture {
    pub dir: TempDir,
    /// Directory the filters watch
    pub logs: PathBuf,
    pub watch: WatchManager,
}

impl Fixture {
    /// Builds the stack with the given live-follower cap (0 = uncapped)
    pub fn new(max_followers: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();

        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let filters = Arc::new(FilterManager::new(store, max_followers));
        let watch = WatchManager::new(filters).unwrap();

        Self { dir, logs, watch }
    }

    /// Rebuilds the stack over an existing directory and state file,
    /// simulating a process restart.
    pub fn reopen(dir: TempDir, max_followers: usize) -> Self {
        let logs = dir.path().join("logs");
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let filters = Arc::new(FilterManager::new(store, max_followers));
        let watch = WatchManager::new(filters).unwrap();
        Self { dir, logs, watch }
    }

    /// Installs a line-engine filter over the logs directory
    pub async fn add_filter(&self, config: &str, patterns: &str, handler: Arc<CollectingHandler>) {
        let spec = FilterSpec::new(
            config,
            &self.logs,
            patterns,
            false,
            EngineParams::line(),
            handler,
        )
        .unwrap();
        self.watch.add(spec).await.unwrap();
    }

    pub fn filters(&self) -> &Arc<FilterManager> {
        self.watch.filter_manager()
    }

    pub async fn follower_count(&self) -> usize {
        self.filters().follower_count().await
    }

    pub fn state_snapshot(&self) -> Vec<(logdrift_core::domain::FollowerKey, u64)> {
        self.filters().store().snapshot()
    }
}

/// Writes `count` numbered lines, each `\n`-terminated
pub fn write_lines(path: &Path, count: usize) {
    let mut content = String::new();
    for i in 0..count {
        content.push_str(&format!("line {i:04}\n"));
    }
    std::fs::write(path, content).unwrap();
}

/// Appends one `\n`-terminated line
pub fn append_line(path: &Path, line: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .unwrap();
    writeln!(file, "{line}").unwrap();
}

/// The numbered lines `write_lines` produces, for equality assertions
pub fn expected_lines(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("line {i:04}")).collect()
}

/// Polls `cond` until it holds or the deadline passes; returns the final
/// evaluation so assertions read naturally.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + EVENT_DEADLINE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

/// Async-condition variant of [`wait_until`]
pub async fn wait_until_async<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + EVENT_DEADLINE;
    while Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond().await
}
