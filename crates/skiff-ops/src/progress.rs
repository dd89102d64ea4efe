//! Progress reporting types for file operations.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use skiff_core::OperationError;

use crate::runner::JobState;

/// The kind of operation a runner performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Copy,
    Move,
    Delete,
    Tar,
    Untar,
    Zip,
    Unzip,
}

impl OperationKind {
    /// Present-tense verb for status lines.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Copy => "Copying",
            Self::Move => "Moving",
            Self::Delete => "Deleting",
            Self::Tar | Self::Zip => "Adding",
            Self::Untar | Self::Unzip => "Extracting",
        }
    }

    /// Past-tense verb for summaries.
    pub fn past(&self) -> &'static str {
        match self {
            Self::Copy => "Copied",
            Self::Move => "Moved",
            Self::Delete => "Deleted",
            Self::Tar | Self::Zip => "Archived",
            Self::Untar | Self::Unzip => "Extracted",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy => write!(f, "Copy"),
            Self::Move => write!(f, "Move"),
            Self::Delete => write!(f, "Delete"),
            Self::Tar => write!(f, "Tar"),
            Self::Untar => write!(f, "Untar"),
            Self::Zip => write!(f, "Zip"),
            Self::Unzip => write!(f, "Unzip"),
        }
    }
}

/// Progress snapshot for an ongoing operation.
#[derive(Debug, Clone)]
pub struct OperationProgress {
    /// The kind of operation.
    pub kind: OperationKind,
    /// Number of items (files, directories, archive entries) completed.
    pub items_done: usize,
    /// Total items measured by the pre-pass (display denominator).
    pub items_total: usize,
    /// Bytes transferred so far.
    pub bytes_done: u64,
    /// Total bytes measured by the pre-pass (0 when unknown).
    pub bytes_total: u64,
    /// The path currently being processed.
    pub current: Option<PathBuf>,
    /// Non-fatal per-path failures encountered so far.
    pub errors: Vec<OperationError>,
    /// Time elapsed since the runner started.
    pub elapsed: Duration,
}

impl OperationProgress {
    /// Create a new progress tracker for an operation.
    pub fn new(kind: OperationKind, items_total: usize, bytes_total: u64) -> Self {
        Self {
            kind,
            items_done: 0,
            items_total,
            bytes_done: 0,
            bytes_total,
            current: None,
            errors: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Get the progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
        } else if self.items_total > 0 {
            (self.items_done as f64 / self.items_total as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Throughput in bytes per second.
    pub fn bytes_per_second(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.bytes_done as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Estimated time remaining, when enough is known to derive one.
    pub fn eta(&self) -> Option<Duration> {
        if self.bytes_total > self.bytes_done {
            let rate = self.bytes_per_second();
            if rate > 0.0 {
                let remaining = (self.bytes_total - self.bytes_done) as f64 / rate;
                return Some(Duration::from_secs_f64(remaining));
            }
        }
        if self.bytes_total == 0 && self.items_done > 0 && self.items_total > self.items_done {
            let per_item = self.elapsed.as_secs_f64() / self.items_done as f64;
            let remaining = per_item * (self.items_total - self.items_done) as f64;
            return Some(Duration::from_secs_f64(remaining));
        }
        None
    }

    /// Status-line narration, e.g. "Copying (12/340): foo.txt".
    pub fn label(&self) -> String {
        let name = self
            .current
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let position = if self.items_total > 0 {
            (self.items_done + 1).min(self.items_total)
        } else {
            self.items_done + 1
        };
        format!(
            "{} ({}/{}): {}",
            self.kind.verb(),
            position,
            self.items_total,
            name
        )
    }

    /// Check if the operation has any errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Add a non-fatal error to the progress.
    pub fn add_error(&mut self, error: OperationError) {
        self.errors.push(error);
    }

    /// Update the path being processed.
    pub fn set_current(&mut self, path: Option<PathBuf>) {
        self.current = path;
    }

    /// Increment the completed-item count.
    pub fn complete_item(&mut self) {
        self.items_done += 1;
    }

    /// Add transferred bytes.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_done += bytes;
    }
}

/// Terminal report for a finished operation.
#[derive(Debug, Clone)]
pub struct OperationComplete {
    /// The kind of operation.
    pub kind: OperationKind,
    /// The terminal state the runner reached.
    pub state: JobState,
    /// Number of items completed.
    pub items_done: usize,
    /// Total bytes transferred.
    pub bytes_done: u64,
    /// Non-fatal errors that occurred.
    pub errors: Vec<OperationError>,
}

impl OperationComplete {
    /// Check if the operation ran to completion with no recorded errors.
    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed && self.errors.is_empty()
    }

    /// Get a human-readable summary of the operation.
    pub fn summary(&self) -> String {
        match self.state {
            JobState::Completed if self.errors.is_empty() => {
                format!("{} {} items", self.kind.past(), self.items_done)
            }
            JobState::Completed => format!(
                "{} {} items, {} error(s)",
                self.kind.past(),
                self.items_done,
                self.errors.len()
            ),
            JobState::Cancelled => format!(
                "{} cancelled after {} items",
                self.kind, self.items_done
            ),
            JobState::Failed => format!(
                "{} failed after {} items: {}",
                self.kind,
                self.items_done,
                self.errors
                    .last()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
            JobState::Pending | JobState::Running => format!("{} in progress", self.kind),
        }
    }
}
