//! Port definitions
//!
//! Trait interfaces implemented outside the core: today just the
//! [`Handler`] that consumes extracted records.

pub mod handler;

pub use handler::Handler;
