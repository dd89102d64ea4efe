//! Core types for the skiff file-operation engine.
//!
//! This crate provides the fundamental data structures shared by the engine
//! and its front-ends: filesystem metadata snapshots and the error taxonomy.

mod entry;
mod error;

pub use entry::{EntryKind, FileEntry};
pub use error::{OperationError, OpsError};
