//! logdrift Follow - directory watching and file following runtime
//!
//! This crate implements the four tightly coupled pieces of the follower
//! core:
//!
//! - [`StateStore`](state::StateStore) - durable, atomic map from
//!   `(config_name, file_path)` to byte offset
//! - [`Follower`](follower::Follower) - streams newly appended records from
//!   one open file, surviving truncation
//! - [`FilterManager`](manager::FilterManager) - owns filters and followers,
//!   dispatches filesystem events, enforces the live-follower cap
//! - [`WatchManager`](watcher::WatchManager) - owns OS watches and the event
//!   loop that drives everything
//!
//! ## Data flow
//!
//! ```text
//! inotify ──→ WatchManager ──→ FilterManager ──→ Follower ──→ Handler
//!                                   │                │
//!                                   └── StateStore ◄─┘  (byte offsets)
//! ```
//!
//! The watch manager subscribes to OS notifications on each watched
//! directory, polls for recreation of previously deleted directories, and
//! dispatches create/write/remove/rename events to the filter manager. The
//! filter manager resolves paths against installed [`FilterSpec`]s and
//! starts or retargets followers. Followers extract delimited records and
//! hand each to a [`Handler`] together with a timestamp and the originating
//! path, advancing their offset cell only after the handler accepts.
//!
//! [`FilterSpec`]: logdrift_core::domain::FilterSpec
//! [`Handler`]: logdrift_core::ports::Handler

pub mod engine;
pub mod error;
pub mod follower;
pub mod manager;
pub mod state;
pub mod watcher;

pub use error::{FollowError, Result};
pub use follower::Follower;
pub use manager::FilterManager;
pub use state::{OffsetCell, StateStore};
pub use watcher::WatchManager;
