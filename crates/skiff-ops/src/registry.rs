//! The owned registry of running operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveFormat;
use crate::delete::start_delete;
use crate::pack::{start_pack, PackOptions};
use crate::progress::OperationKind;
use crate::runner::{JobHandle, JobStatus, StatusCell};
use crate::transfer::{start_copy, start_move, TransferOptions};
use crate::unpack::{start_untar, start_unzip};

/// Identifier for one registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct RegisteredJob {
    id: JobId,
    kind: OperationKind,
    status: StatusCell,
    cancel: CancellationToken,
}

/// The process-wide list of active runners, owned by whatever drives the
/// front-end loop. Registration and removal are ordinary method calls; there
/// is no global state.
///
/// Nothing serializes runners against each other: starting operations that
/// touch overlapping paths concurrently is a caller error, not a protected
/// case.
#[derive(Debug)]
pub struct JobRegistry {
    next_id: u64,
    jobs: Vec<RegisteredJob>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            jobs: Vec::new(),
        }
    }

    /// Start and register a copy of `sources` into `destination`.
    pub fn copy(
        &mut self,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        options: TransferOptions,
    ) -> (JobId, JobHandle) {
        let handle = start_copy(sources, destination, options);
        (self.register(&handle), handle)
    }

    /// Start and register a move of `sources` into `destination`.
    pub fn move_to(
        &mut self,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        options: TransferOptions,
    ) -> (JobId, JobHandle) {
        let handle = start_move(sources, destination, options);
        (self.register(&handle), handle)
    }

    /// Start and register a delete of `targets`.
    pub fn delete(&mut self, targets: Vec<PathBuf>) -> (JobId, JobHandle) {
        let handle = start_delete(targets);
        (self.register(&handle), handle)
    }

    /// Start and register a tar-family pack. The container format follows the
    /// destination's extension; a bare name gets a plain tar.
    pub fn tar(
        &mut self,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        options: PackOptions,
    ) -> (JobId, JobHandle) {
        let format = ArchiveFormat::detect(&destination)
            .filter(ArchiveFormat::is_tar)
            .unwrap_or(ArchiveFormat::Tar);
        let handle = start_pack(format, sources, destination, options);
        (self.register(&handle), handle)
    }

    /// Start and register a zip pack.
    pub fn zip(
        &mut self,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        options: PackOptions,
    ) -> (JobId, JobHandle) {
        let handle = start_pack(ArchiveFormat::Zip, sources, destination, options);
        (self.register(&handle), handle)
    }

    /// Start and register an extraction of tar archives into `destination`.
    pub fn untar(&mut self, archives: Vec<PathBuf>, destination: PathBuf) -> (JobId, JobHandle) {
        let handle = start_untar(archives, destination);
        (self.register(&handle), handle)
    }

    /// Start and register an extraction of zip archives into `destination`.
    pub fn unzip(&mut self, archives: Vec<PathBuf>, destination: PathBuf) -> (JobId, JobHandle) {
        let handle = start_unzip(archives, destination);
        (self.register(&handle), handle)
    }

    fn register(&mut self, handle: &JobHandle) -> JobId {
        let id = JobId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.jobs.push(RegisteredJob {
            id,
            kind: handle.kind,
            status: handle.status_cell(),
            cancel: handle.token(),
        });
        id
    }

    /// Request cancellation of the longest-registered still-active runner.
    pub fn kill_oldest(&mut self) -> Option<JobId> {
        let job = self
            .jobs
            .iter()
            .find(|job| !job.status.snapshot().state.is_terminal())?;
        job.cancel.cancel();
        Some(job.id)
    }

    /// Number of runners that have not reached a terminal state.
    pub fn running(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| !job.status.snapshot().state.is_terminal())
            .count()
    }

    /// Whether no registered operation is still running. Front-ends keep
    /// their sub-loop alive until this turns true.
    pub fn is_idle(&self) -> bool {
        self.running() == 0
    }

    /// Best-effort status of every registered runner, oldest first.
    pub fn statuses(&self) -> Vec<(JobId, JobStatus)> {
        self.jobs
            .iter()
            .map(|job| (job.id, job.status.snapshot()))
            .collect()
    }

    /// Drop runners that reached a terminal state and return their final
    /// status, so the caller can reload the directories they touched.
    pub fn reap(&mut self) -> Vec<(JobId, JobStatus)> {
        let mut finished = Vec::new();
        self.jobs.retain(|job| {
            let status = job.status.snapshot();
            if status.state.is_terminal() {
                finished.push((job.id, status));
                false
            } else {
                true
            }
        });
        finished
    }

    /// Kinds of the currently registered runners, oldest first.
    pub fn kinds(&self) -> Vec<OperationKind> {
        self.jobs.iter().map(|job| job.kind).collect()
    }
}
