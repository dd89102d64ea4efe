//! Copy and move runners.
//!
//! Both consume the job generator lazily. Copy streams bytes through a
//! bounded buffer and restores metadata afterwards; move renames first and
//! falls back to copy-plus-remove when the rename crosses a filesystem
//! boundary.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, warn};

use skiff_core::{EntryKind, FileEntry, OperationError, OpsError};

use crate::conflict::{ConflictPolicy, ConflictResolver};
use crate::generate::JobGenerator;
use crate::job::Job;
use crate::progress::{OperationKind, OperationProgress};
use crate::runner::{error_record, JobHandle, JobState, RunnerContext};

/// Buffer size for byte-for-byte file copies. Cancellation is observed at
/// chunk boundaries, so this also bounds how much is written after a cancel.
const COPY_BUFFER_SIZE: usize = 128 * 1024;

/// Options for copy and move operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    /// How conflicts are resolved when a destination already exists.
    pub conflicts: ConflictPolicy,
}

/// Start a background copy of `sources` into `destination`.
pub fn start_copy(
    sources: Vec<PathBuf>,
    destination: PathBuf,
    options: TransferOptions,
) -> JobHandle {
    start_transfer(OperationKind::Copy, sources, destination, false, options)
}

/// Start a background move of `sources` into `destination`.
pub fn start_move(
    sources: Vec<PathBuf>,
    destination: PathBuf,
    options: TransferOptions,
) -> JobHandle {
    start_transfer(OperationKind::Move, sources, destination, true, options)
}

fn start_transfer(
    kind: OperationKind,
    sources: Vec<PathBuf>,
    destination: PathBuf,
    moving: bool,
    options: TransferOptions,
) -> JobHandle {
    let (context, handle) = RunnerContext::channel(kind);
    tokio::task::spawn_blocking(move || {
        transfer_worker(context, sources, destination, moving, options);
    });
    handle
}

fn transfer_worker(
    context: RunnerContext,
    sources: Vec<PathBuf>,
    destination: PathBuf,
    moving: bool,
    options: TransferOptions,
) {
    context.set_running();
    let (items_total, bytes_total) = measure(&sources);
    let mut progress = OperationProgress::new(context.kind, items_total, bytes_total);

    let resolver = ConflictResolver::new(context.sender(), options.conflicts);
    let generator = match JobGenerator::new(&sources, &destination, moving, resolver) {
        Ok(generator) => generator,
        Err(err) => {
            progress.add_error(error_record(&err));
            context.finish(JobState::Failed, progress);
            return;
        }
    };

    let state = run_jobs(&context, generator, moving, &mut progress);
    context.finish(state, progress);
}

fn run_jobs(
    context: &RunnerContext,
    mut generator: JobGenerator,
    moving: bool,
    progress: &mut OperationProgress,
) -> JobState {
    loop {
        if context.is_cancelled() {
            return JobState::Cancelled;
        }
        let job = match generator.next() {
            None => return JobState::Completed,
            Some(Ok(job)) => job,
            Some(Err(OpsError::Aborted)) => return JobState::Cancelled,
            Some(Err(err)) => {
                progress.add_error(error_record(&err));
                return JobState::Failed;
            }
        };

        progress.set_current(Some(job.display_path().to_path_buf()));
        context.send_progress(progress);
        debug!(job = ?job.display_path(), "executing job");

        match execute_job(context, &job, moving, progress) {
            Ok(JobRun::Done) => {
                if job.counts_as_item() {
                    progress.complete_item();
                }
                context.send_progress(progress);
            }
            Ok(JobRun::Cancelled) => return JobState::Cancelled,
            Err(err) => {
                progress.add_error(error_record(&err));
                return JobState::Failed;
            }
        }
    }
}

/// Outcome of one job: finished, or stopped at a cancellation point.
enum JobRun {
    Done,
    Cancelled,
}

fn execute_job(
    context: &RunnerContext,
    job: &Job,
    moving: bool,
    progress: &mut OperationProgress,
) -> Result<JobRun, OpsError> {
    match job {
        Job::CreateDir { dest, template } => {
            fs::create_dir_all(dest).map_err(|e| OpsError::io(dest, e))?;
            restore_metadata(dest, template, progress);
            Ok(JobRun::Done)
        }
        Job::CopyFile { source, dest } | Job::CopySymlink { source, dest } if moving => {
            move_entry(context, source, dest, progress)
        }
        Job::CopyFile { source, dest } => copy_entry(context, source, dest, progress),
        Job::CopySymlink { source, dest } => {
            copy_symlink(source, dest)?;
            Ok(JobRun::Done)
        }
        Job::RemoveSourceDir { path } => match fs::remove_dir(path) {
            Ok(()) => Ok(JobRun::Done),
            Err(err) if removal_tolerated(&err) => {
                warn!(path = %path.display(), error = %err, "source directory left behind");
                progress.add_error(OperationError::new(path.clone(), err.to_string()));
                Ok(JobRun::Done)
            }
            Err(err) => Err(OpsError::io(path, err)),
        },
    }
}

/// Copy one non-directory entry, dispatching on its kind.
fn copy_entry(
    context: &RunnerContext,
    source: &FileEntry,
    dest: &Path,
    progress: &mut OperationProgress,
) -> Result<JobRun, OpsError> {
    match &source.kind {
        EntryKind::File => {
            let end = copy_contents(context, &source.path, dest, progress)?;
            match end {
                CopyEnd::Done => {
                    restore_metadata(dest, source, progress);
                    Ok(JobRun::Done)
                }
                CopyEnd::Cancelled => {
                    // Partial destination files are an accepted, reported
                    // side effect of cancellation.
                    progress.add_error(OperationError::new(
                        dest.to_path_buf(),
                        "cancelled mid-copy, destination left partial",
                    ));
                    Ok(JobRun::Cancelled)
                }
            }
        }
        EntryKind::Fifo => {
            recreate_fifo(source, dest)?;
            Ok(JobRun::Done)
        }
        _ => {
            progress.add_error(OperationError::new(
                source.path.clone(),
                "special file not copied",
            ));
            Ok(JobRun::Done)
        }
    }
}

/// Move one non-directory entry: rename, then cross-device fallback.
fn move_entry(
    context: &RunnerContext,
    source: &FileEntry,
    dest: &Path,
    progress: &mut OperationProgress,
) -> Result<JobRun, OpsError> {
    match fs::rename(&source.path, dest) {
        Ok(()) => {
            progress.add_bytes(source.size);
            context.send_progress(progress);
            Ok(JobRun::Done)
        }
        Err(err) if is_cross_device(&err) => {
            debug!(source = %source.path.display(), "cross-device rename, falling back to copy");
            let run = match &source.kind {
                EntryKind::Symlink { .. } => {
                    copy_symlink(source, dest)?;
                    JobRun::Done
                }
                _ => copy_entry(context, source, dest, progress)?,
            };
            if matches!(run, JobRun::Cancelled) {
                return Ok(run);
            }
            // The copy is never rolled back when the source removal fails.
            if let Err(err) = fs::remove_file(&source.path) {
                warn!(path = %source.path.display(), error = %err, "moved source not removed");
                progress.add_error(OperationError::new(
                    source.path.clone(),
                    format!("source not removed: {err}"),
                ));
            }
            Ok(JobRun::Done)
        }
        Err(err) => Err(OpsError::io(&source.path, err)),
    }
}

/// Where a byte copy ended.
enum CopyEnd {
    Done,
    Cancelled,
}

/// Stream bytes through a bounded buffer, bumping progress per chunk and
/// observing cancellation at chunk boundaries. The chunk in flight when the
/// flag flips is always written out.
fn copy_contents(
    context: &RunnerContext,
    source: &Path,
    dest: &Path,
    progress: &mut OperationProgress,
) -> Result<CopyEnd, OpsError> {
    let mut reader = File::open(source).map_err(|e| OpsError::io(source, e))?;
    let mut writer = File::create(dest).map_err(|e| OpsError::io(dest, e))?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

    let mut read = reader.read(&mut buffer).map_err(|e| OpsError::io(source, e))?;
    while read > 0 {
        writer
            .write_all(&buffer[..read])
            .map_err(|e| OpsError::io(dest, e))?;
        progress.add_bytes(read as u64);
        context.send_progress(progress);

        read = reader.read(&mut buffer).map_err(|e| OpsError::io(source, e))?;
        if read > 0 && context.is_cancelled() {
            return Ok(CopyEnd::Cancelled);
        }
    }
    Ok(CopyEnd::Done)
}

/// Recreate a symlink pointing at the same unresolved target string. Never
/// copies an object through the link.
fn copy_symlink(source: &FileEntry, dest: &Path) -> Result<(), OpsError> {
    let EntryKind::Symlink { target } = &source.kind else {
        return Err(OpsError::Unsupported {
            path: source.path.clone(),
            message: "not a symlink".to_string(),
        });
    };
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest).map_err(|e| OpsError::io(dest, e))?;
    }
    make_symlink(target, dest)
}

#[cfg(unix)]
fn make_symlink(target: &Path, dest: &Path) -> Result<(), OpsError> {
    std::os::unix::fs::symlink(target, dest).map_err(|e| OpsError::io(dest, e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, dest: &Path) -> Result<(), OpsError> {
    Err(OpsError::Unsupported {
        path: dest.to_path_buf(),
        message: "symlink copy is not supported on this platform".to_string(),
    })
}

#[cfg(unix)]
fn recreate_fifo(source: &FileEntry, dest: &Path) -> Result<(), OpsError> {
    use nix::sys::stat::Mode;

    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest).map_err(|e| OpsError::io(dest, e))?;
    }
    nix::unistd::mkfifo(dest, Mode::from_bits_truncate(source.permissions() as _))
        .map_err(|e| OpsError::io(dest, std::io::Error::from(e)))
}

#[cfg(not(unix))]
fn recreate_fifo(source: &FileEntry, _dest: &Path) -> Result<(), OpsError> {
    Err(OpsError::Unsupported {
        path: source.path.clone(),
        message: "named pipes are not supported on this platform".to_string(),
    })
}

/// Copy mode, ownership and timestamps from the snapshot onto `path`.
///
/// Ownership restore is best-effort: it fails for any non-root caller, so it
/// is logged rather than recorded.
fn restore_metadata(path: &Path, template: &FileEntry, progress: &mut OperationProgress) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Err(err) =
            fs::set_permissions(path, fs::Permissions::from_mode(template.permissions()))
        {
            progress.add_error(OperationError::new(
                path.to_path_buf(),
                format!("mode not restored: {err}"),
            ));
        }
        if let Err(err) = std::os::unix::fs::chown(path, Some(template.uid), Some(template.gid)) {
            debug!(path = %path.display(), error = %err, "ownership not restored");
        }
    }

    let mtime = FileTime::from_system_time(template.mtime);
    if let Err(err) = filetime::set_file_times(path, mtime, mtime) {
        progress.add_error(OperationError::new(
            path.to_path_buf(),
            format!("timestamps not restored: {err}"),
        ));
    }
}

/// Pre-pass totals (item count, byte sum) for the progress denominator.
pub(crate) fn measure(sources: &[PathBuf]) -> (usize, u64) {
    let mut items = 0usize;
    let mut bytes = 0u64;
    for source in sources {
        for entry in jwalk::WalkDir::new(source)
            .skip_hidden(false)
            .follow_links(false)
            .sort(false)
        {
            let Ok(entry) = entry else { continue };
            items += 1;
            if entry.file_type().is_file() {
                bytes += fs::symlink_metadata(entry.path()).map(|m| m.len()).unwrap_or(0);
            }
        }
    }
    (items, bytes)
}

/// Whether a rename failed because source and destination live on different
/// filesystems.
fn is_cross_device(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::CrossesDevices || error.raw_os_error() == Some(18)
}

/// Directory-removal failures tolerated during cleanup: a concurrent write
/// re-populated the directory, or someone else removed it first.
pub(crate) fn removal_tolerated(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::NotFound
    ) || error.raw_os_error() == Some(39)
}
