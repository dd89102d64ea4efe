//! Shared runner plumbing: lifecycle states, status cells, handles and the
//! event stream every operation kind reports through.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use skiff_core::{OperationError, OpsError};

use crate::conflict::ConflictRequest;
use crate::progress::{OperationComplete, OperationKind, OperationProgress};
use crate::JOB_EVENT_CHANNEL_SIZE;

/// Lifecycle of one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    /// Whether the runner has finished, one way or another.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Best-effort status snapshot a front-end may read at any time.
///
/// Written only by the owning runner; a display that is stale by one frame is
/// acceptable.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// The kind of operation.
    pub kind: OperationKind,
    /// Current lifecycle state.
    pub state: JobState,
    /// Human-readable narration of the current step.
    pub detail: String,
    /// Cumulative bytes transferred.
    pub bytes_done: u64,
}

/// Shared cell the owning runner writes and the registry reads.
#[derive(Debug, Clone)]
pub(crate) struct StatusCell {
    inner: Arc<Mutex<JobStatus>>,
}

impl StatusCell {
    fn new(kind: OperationKind) -> Self {
        Self {
            inner: Arc::new(Mutex::new(JobStatus {
                kind,
                state: JobState::Pending,
                detail: String::new(),
                bytes_done: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobStatus> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.lock().state = state;
    }

    pub(crate) fn update(&self, detail: String, bytes_done: u64) {
        let mut status = self.lock();
        status.detail = detail;
        status.bytes_done = bytes_done;
    }

    pub(crate) fn snapshot(&self) -> JobStatus {
        self.lock().clone()
    }
}

/// Events delivered to the operation's owner.
#[derive(Debug)]
pub enum JobEvent {
    /// Progress snapshot, delivered best-effort at arbitrary frequency.
    Progress(OperationProgress),
    /// A conflict needs an interactive decision.
    Conflict(ConflictRequest),
    /// The operation reached a terminal state.
    Complete(OperationComplete),
}

/// Owner-side handle for one running operation.
#[derive(Debug)]
pub struct JobHandle {
    /// The kind of operation.
    pub kind: OperationKind,
    events: mpsc::Receiver<JobEvent>,
    cancel: CancellationToken,
    status: StatusCell,
}

impl JobHandle {
    /// Request cooperative cancellation. Already-issued jobs still complete;
    /// the runner observes the flag before the next job (or chunk) begins.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Read the runner's current status.
    pub fn status(&self) -> JobStatus {
        self.status.snapshot()
    }

    /// Receive the next event; `None` once the runner is gone.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    pub(crate) fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Worker-side half of a runner: event sender, cancellation flag, status cell.
#[derive(Debug)]
pub(crate) struct RunnerContext {
    pub(crate) kind: OperationKind,
    tx: mpsc::Sender<JobEvent>,
    cancel: CancellationToken,
    status: StatusCell,
    started: Instant,
}

impl RunnerContext {
    /// Create the worker context and the matching owner handle.
    pub(crate) fn channel(kind: OperationKind) -> (Self, JobHandle) {
        let (tx, rx) = mpsc::channel(JOB_EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let status = StatusCell::new(kind);
        let context = Self {
            kind,
            tx,
            cancel: cancel.clone(),
            status: status.clone(),
            started: Instant::now(),
        };
        let handle = JobHandle {
            kind,
            events: rx,
            cancel,
            status,
        };
        (context, handle)
    }

    pub(crate) fn set_running(&self) {
        self.status.set_state(JobState::Running);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sender half for the conflict resolver.
    pub(crate) fn sender(&self) -> mpsc::Sender<JobEvent> {
        self.tx.clone()
    }

    /// Best-effort progress delivery; the status cell always reflects it even
    /// when the channel is full.
    pub(crate) fn send_progress(&self, progress: &mut OperationProgress) {
        progress.elapsed = self.started.elapsed();
        self.status.update(progress.label(), progress.bytes_done);
        let _ = self.tx.try_send(JobEvent::Progress(progress.clone()));
    }

    /// Reliable terminal delivery; marks the status cell first so registry
    /// readers see the terminal state even if the receiver is gone.
    pub(crate) fn finish(&self, state: JobState, progress: OperationProgress) {
        let complete = OperationComplete {
            kind: self.kind,
            state,
            items_done: progress.items_done,
            bytes_done: progress.bytes_done,
            errors: progress.errors,
        };
        self.status.update(complete.summary(), complete.bytes_done);
        self.status.set_state(state);
        let _ = self.tx.blocking_send(JobEvent::Complete(complete));
    }
}

/// Turn a fatal error into the per-path record carried on the final report.
pub(crate) fn error_record(error: &OpsError) -> OperationError {
    let path = error
        .path()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    OperationError::new(path, error.to_string())
}
