//! Domain entities and value types
//!
//! Pure data types shared by the follower runtime and its embedders:
//! filter specifications, follower keys, stable file identities and
//! record-engine parameters.

pub mod engine;
pub mod errors;
pub mod filter;
pub mod identity;

pub use engine::{EngineKind, EngineParams, DEFAULT_MAX_RECORD_LEN};
pub use errors::DomainError;
pub use filter::{FilterSpec, FollowerKey};
pub use identity::FileIdentity;
