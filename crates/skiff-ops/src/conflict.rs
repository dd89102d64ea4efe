//! Conflict detection and interactive resolution.
//!
//! The resolver is the engine's only interactive point: when a destination
//! already exists it sends a [`ConflictRequest`] down the runner's event
//! channel and parks the worker until the front-end answers (or drops the
//! prompt, which counts as Cancel). "All" answers become sticky and silence
//! every later conflict in the same operation.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use skiff_core::{FileEntry, OpsError};

use crate::runner::JobEvent;

/// Answers the front-end may give at a conflict prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictChoice {
    /// Overwrite this destination.
    Yes,
    /// Keep this destination.
    No,
    /// Overwrite only if the source is strictly newer. Not sticky.
    Newer,
    /// Overwrite this and every later conflict.
    YesAll,
    /// Keep this and every later conflict.
    NoAll,
    /// Abort the whole operation.
    Cancel,
}

/// Per-pair resolution after stickiness and the Newer comparison are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Proceed,
    Skip,
}

/// Non-interactive seed for a whole operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Ask the front-end for each conflict.
    #[default]
    Prompt,
    /// Overwrite every conflicting destination without asking.
    ProceedAll,
    /// Keep every conflicting destination without asking.
    SkipAll,
}

impl ConflictPolicy {
    fn sticky(self) -> Option<Decision> {
        match self {
            Self::Prompt => None,
            Self::ProceedAll => Some(Decision::Proceed),
            Self::SkipAll => Some(Decision::Skip),
        }
    }
}

/// A pending prompt: the destination already exists and differs materially
/// from a fresh creation.
#[derive(Debug)]
pub struct ConflictRequest {
    /// Snapshot of the source side.
    pub source: FileEntry,
    /// Snapshot of the existing destination.
    pub existing: FileEntry,
    reply: oneshot::Sender<ConflictChoice>,
}

impl ConflictRequest {
    /// Answer the prompt, waking the parked worker.
    pub fn answer(self, choice: ConflictChoice) {
        let _ = self.reply.send(choice);
    }
}

/// Applies sticky decisions and prompts through the event channel otherwise.
#[derive(Debug)]
pub struct ConflictResolver {
    events: mpsc::Sender<JobEvent>,
    sticky: Option<Decision>,
}

impl ConflictResolver {
    /// Create a resolver that prompts through `events`, seeded by `policy`.
    pub fn new(events: mpsc::Sender<JobEvent>, policy: ConflictPolicy) -> Self {
        Self {
            events,
            sticky: policy.sticky(),
        }
    }

    /// Decide whether `source` may be written over `existing`.
    ///
    /// No prompt when the destination is absent or its base name differs from
    /// the source's (no real conflict), or when a sticky decision is already
    /// in effect. Blocks on the front-end's reply otherwise; must run on a
    /// worker thread.
    pub fn resolve(
        &mut self,
        source: &FileEntry,
        existing: Option<&FileEntry>,
    ) -> Result<Decision, OpsError> {
        let Some(existing) = existing else {
            return Ok(Decision::Proceed);
        };
        if source.file_name() != existing.file_name() {
            return Ok(Decision::Proceed);
        }
        if let Some(decision) = self.sticky {
            return Ok(decision);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ConflictRequest {
            source: source.clone(),
            existing: existing.clone(),
            reply: reply_tx,
        };
        if self
            .events
            .blocking_send(JobEvent::Conflict(request))
            .is_err()
        {
            return Err(OpsError::Aborted);
        }
        // A dropped prompt is a dismissal, which is Cancel.
        let choice = reply_rx.blocking_recv().unwrap_or(ConflictChoice::Cancel);

        match choice {
            ConflictChoice::Yes => Ok(Decision::Proceed),
            ConflictChoice::No => Ok(Decision::Skip),
            ConflictChoice::Newer => Ok(if source.newer_than(existing) {
                Decision::Proceed
            } else {
                Decision::Skip
            }),
            ConflictChoice::YesAll => {
                self.sticky = Some(Decision::Proceed);
                Ok(Decision::Proceed)
            }
            ConflictChoice::NoAll => {
                self.sticky = Some(Decision::Skip);
                Ok(Decision::Skip)
            }
            ConflictChoice::Cancel => Err(OpsError::Aborted),
        }
    }
}
