//! Merge-conflict tracking for interrupted operations.
//!
//! The conflict subsystem is responsible for:
//! 1. **State** -- applying backend events to the current conflict set and
//!    dropping events for operations that are no longer current.
//! 2. **Actions** -- resolve, continue, abort and run, sent over the request
//!    channel with continue gated on every file being settled.

pub mod orchestrator;
pub mod store;

pub use orchestrator::{ConflictOrchestrator, SharedConflictStore};
pub use store::{Applied, ConflictStore};
