//! Integration tests for logdrift-follow
//!
//! Exercises the full stack (watch manager, filter manager, followers,
//! state store) against a real temporary directory tree and real inotify
//! events: creation, appends, deletion, rotation by rename, truncation and
//! the live-follower cap.

mod common;

mod test_follow;
mod test_rotation;
mod test_state;
