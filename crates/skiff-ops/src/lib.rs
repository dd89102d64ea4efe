//! File operations engine for skiff.
//!
//! This crate performs copy, move, delete and archive operations in the
//! background while the interactive front-end keeps responding. Each
//! operation runs on its own blocking worker and reports through a bounded
//! channel; conflicts surface as prompt requests the front-end answers over a
//! oneshot reply, and cancellation is cooperative via a token checked between
//! jobs and between buffer-sized chunks.

mod archive;
mod conflict;
mod delete;
mod generate;
mod job;
mod pack;
mod progress;
mod registry;
mod runner;
mod transfer;
mod unpack;

pub use archive::ArchiveFormat;
pub use conflict::{ConflictChoice, ConflictPolicy, ConflictRequest, ConflictResolver, Decision};
pub use delete::start_delete;
pub use generate::{resolve_destinations, JobGenerator};
pub use job::Job;
pub use pack::{start_pack, CreateMode, PackOptions};
pub use progress::{OperationComplete, OperationKind, OperationProgress};
pub use registry::{JobId, JobRegistry};
pub use runner::{JobEvent, JobHandle, JobState, JobStatus};
pub use transfer::{start_copy, start_move, TransferOptions};
pub use unpack::{start_untar, start_unzip};

/// Bounded size of each runner's event channel.
pub const JOB_EVENT_CHANNEL_SIZE: usize = 100;
