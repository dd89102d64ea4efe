//! Delete runner: depth-first removal, files before the directories that
//! contain them.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use skiff_core::{OperationError, OpsError};

use crate::generate::read_dir_sorted;
use crate::progress::{OperationKind, OperationProgress};
use crate::runner::{error_record, JobHandle, JobState, RunnerContext};
use crate::transfer::{measure, removal_tolerated};

/// Start a background delete of every path in `targets`.
pub fn start_delete(targets: Vec<PathBuf>) -> JobHandle {
    let (context, handle) = RunnerContext::channel(OperationKind::Delete);
    tokio::task::spawn_blocking(move || delete_worker(context, targets));
    handle
}

fn delete_worker(context: RunnerContext, targets: Vec<PathBuf>) {
    context.set_running();
    let (items_total, _) = measure(&targets);
    let mut progress = OperationProgress::new(OperationKind::Delete, items_total, 0);

    let mut state = JobState::Completed;
    for target in &targets {
        match delete_tree(&context, target, &mut progress) {
            Ok(true) => {}
            Ok(false) => {
                state = JobState::Cancelled;
                break;
            }
            Err(err) => {
                progress.add_error(error_record(&err));
                state = JobState::Failed;
                break;
            }
        }
    }
    context.finish(state, progress);
}

/// Remove one tree. Returns `Ok(false)` when cancellation was observed.
fn delete_tree(
    context: &RunnerContext,
    path: &Path,
    progress: &mut OperationProgress,
) -> Result<bool, OpsError> {
    if context.is_cancelled() {
        return Ok(false);
    }

    let metadata = fs::symlink_metadata(path).map_err(|e| OpsError::io(path, e))?;
    if metadata.is_dir() {
        for name in read_dir_sorted(path)? {
            if !delete_tree(context, &path.join(name), progress)? {
                return Ok(false);
            }
        }
        progress.set_current(Some(path.to_path_buf()));
        context.send_progress(progress);
        match fs::remove_dir(path) {
            Ok(()) => {}
            Err(err) if removal_tolerated(&err) => {
                // A concurrent write re-populated the directory; report it
                // and keep going rather than failing the whole delete.
                warn!(path = %path.display(), error = %err, "directory not removed");
                progress.add_error(OperationError::new(path.to_path_buf(), err.to_string()));
            }
            Err(err) => return Err(OpsError::io(path, err)),
        }
    } else {
        progress.set_current(Some(path.to_path_buf()));
        context.send_progress(progress);
        fs::remove_file(path).map_err(|e| OpsError::io(path, e))?;
    }

    progress.complete_item();
    context.send_progress(progress);
    Ok(true)
}
