//! # voyager-error
//!
//! Unified error handling for the voyager harness.
//!
//! ## Design Philosophy
//!
//! - **ErrorKind**: Know what failed (e.g., LaunchTimeout, MalformedOutput, PossiblySucceeded)
//! - **ErrorStatus**: Decide how to handle it (Permanent, Temporary, Persistent)
//! - **Error Context**: Locate the cause with key-value pairs (pid, skill_id, signature)
//! - **Error Source**: Wrap underlying errors without leaking raw types
//!
//! ## Usage
//!
//! ```rust
//! use voyager_error::{Error, ErrorKind};
//!
//! fn example() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::LaunchTimeout, "validator never printed its ready marker")
//!         .with_operation("validator::start")
//!         .with_context("binary", "surfpool")
//!         .with_context("timeout_secs", "60"))
//! }
//! ```
//!
//! ## Principles
//!
//! - Fallible functions return `Result<T, voyager_error::Error>`
//! - External errors are wrapped with `set_source(err)`
//! - Same error handled once, subsequent layers only append context
//! - Attempt-level failures stay values; only `is_episode_fatal()` kinds abort an episode

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

/// Result type alias using the voyager Error
pub type Result<T> = std::result::Result<T, Error>;
