//! Archive extraction runners (tar family and zip).
//!
//! Members are processed in archive order. Files get their mode and mtime
//! restored immediately; directory metadata is deferred and applied in a
//! final deepest-first pass, since writing into a directory would invalidate
//! a timestamp restored too early.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use filetime::FileTime;
use flate2::read::GzDecoder;
use tracing::{debug, warn};
use xz2::read::XzDecoder;
use zip::ZipArchive;

use skiff_core::{OperationError, OpsError};

use crate::archive::{sanitize_extract_path, ArchiveFormat};
use crate::progress::{OperationKind, OperationProgress};
use crate::runner::{error_record, JobHandle, JobState, RunnerContext};

/// Start a background extraction of tar archives into `destination`.
pub fn start_untar(archives: Vec<PathBuf>, destination: PathBuf) -> JobHandle {
    start_unpack_kind(OperationKind::Untar, archives, destination)
}

/// Start a background extraction of zip archives into `destination`.
pub fn start_unzip(archives: Vec<PathBuf>, destination: PathBuf) -> JobHandle {
    start_unpack_kind(OperationKind::Unzip, archives, destination)
}

fn start_unpack_kind(
    kind: OperationKind,
    archives: Vec<PathBuf>,
    destination: PathBuf,
) -> JobHandle {
    let (context, handle) = RunnerContext::channel(kind);
    tokio::task::spawn_blocking(move || unpack_worker(context, archives, destination));
    handle
}

/// Deferred directory metadata, applied deepest-first once every child has
/// been materialized.
#[derive(Debug)]
struct DirFixup {
    path: PathBuf,
    mode: Option<u32>,
    mtime: Option<i64>,
}

fn unpack_worker(context: RunnerContext, archives: Vec<PathBuf>, destination: PathBuf) {
    context.set_running();

    // Entry totals are precomputed solely to drive the (n/total) display.
    let mut items_total = 0usize;
    for archive in &archives {
        match count_entries(archive) {
            Ok(count) => items_total += count,
            Err(err) => {
                let mut progress = OperationProgress::new(context.kind, 0, 0);
                progress.add_error(error_record(&err));
                context.finish(JobState::Failed, progress);
                return;
            }
        }
    }

    let mut progress = OperationProgress::new(context.kind, items_total, 0);
    let mut state = JobState::Completed;
    for archive in &archives {
        match extract_archive(&context, archive, &destination, &mut progress) {
            Ok(JobState::Cancelled) => {
                state = JobState::Cancelled;
                break;
            }
            Ok(_) => {}
            Err(err) => {
                progress.add_error(error_record(&err));
                state = JobState::Failed;
                break;
            }
        }
    }
    context.finish(state, progress);
}

fn count_entries(path: &Path) -> Result<usize, OpsError> {
    let format = ArchiveFormat::detect(path)
        .ok_or_else(|| OpsError::archive(path, "unrecognized archive format"))?;
    if format == ArchiveFormat::Zip {
        let file = File::open(path).map_err(|e| OpsError::io(path, e))?;
        let archive =
            ZipArchive::new(file).map_err(|e| OpsError::archive(path, e.to_string()))?;
        return Ok(archive.len());
    }

    let mut archive = tar::Archive::new(tar_reader(path, format)?);
    let mut count = 0usize;
    for entry in archive
        .entries()
        .map_err(|e| OpsError::archive(path, e.to_string()))?
    {
        entry.map_err(|e| OpsError::archive(path, e.to_string()))?;
        count += 1;
    }
    Ok(count)
}

fn tar_reader(path: &Path, format: ArchiveFormat) -> Result<Box<dyn Read>, OpsError> {
    let file = File::open(path).map_err(|e| OpsError::io(path, e))?;
    Ok(match format {
        ArchiveFormat::Tar => Box::new(file),
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarBz2 => Box::new(BzDecoder::new(file)),
        ArchiveFormat::TarXz => Box::new(XzDecoder::new(file)),
        ArchiveFormat::Zip => {
            return Err(OpsError::archive(path, "not a tar archive"));
        }
    })
}

fn extract_archive(
    context: &RunnerContext,
    archive_path: &Path,
    destination: &Path,
    progress: &mut OperationProgress,
) -> Result<JobState, OpsError> {
    let format = ArchiveFormat::detect(archive_path)
        .ok_or_else(|| OpsError::archive(archive_path, "unrecognized archive format"))?;
    debug!(archive = %archive_path.display(), format = %format, "extracting");

    if format == ArchiveFormat::Zip {
        extract_zip(context, archive_path, destination, progress)
    } else {
        let archive = tar::Archive::new(tar_reader(archive_path, format)?);
        extract_tar(context, archive, archive_path, destination, progress)
    }
}

fn extract_tar<R: Read>(
    context: &RunnerContext,
    mut archive: tar::Archive<R>,
    archive_path: &Path,
    destination: &Path,
    progress: &mut OperationProgress,
) -> Result<JobState, OpsError> {
    let mut fixups: Vec<DirFixup> = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| OpsError::archive(archive_path, e.to_string()))?
    {
        if context.is_cancelled() {
            apply_dir_fixups(fixups, progress);
            return Ok(JobState::Cancelled);
        }
        let mut entry = entry.map_err(|e| OpsError::archive(archive_path, e.to_string()))?;
        let raw = entry
            .path()
            .map_err(|e| OpsError::archive(archive_path, e.to_string()))?
            .into_owned();
        let size = entry.size();

        let Some(target) = sanitize_extract_path(destination, &raw) else {
            warn!(member = %raw.display(), "unsafe archive member ignored");
            progress.add_error(OperationError::new(raw, "unsafe member path ignored"));
            progress.complete_item();
            continue;
        };
        progress.set_current(Some(target.clone()));
        context.send_progress(progress);

        let header = entry.header();
        let mode = header.mode().ok();
        let mtime = header.mtime().ok().map(|secs| secs as i64);
        let entry_type = header.entry_type();

        if entry_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| OpsError::io(&target, e))?;
            fixups.push(DirFixup {
                path: target,
                mode,
                mtime,
            });
        } else if entry_type.is_symlink() {
            let link = entry
                .link_name()
                .map_err(|e| OpsError::archive(archive_path, e.to_string()))?;
            match link {
                Some(link) => {
                    ensure_parent(&target)?;
                    if fs::symlink_metadata(&target).is_ok() {
                        fs::remove_file(&target).map_err(|e| OpsError::io(&target, e))?;
                    }
                    make_symlink(link.as_ref(), &target)?;
                }
                None => {
                    progress.add_error(OperationError::new(
                        target.clone(),
                        "symlink member without a target",
                    ));
                }
            }
        } else if entry_type.is_hard_link() {
            // Hard links point at a member extracted earlier in this run.
            let link = entry
                .link_name()
                .map_err(|e| OpsError::archive(archive_path, e.to_string()))?;
            let original = link.and_then(|l| sanitize_extract_path(destination, l.as_ref()));
            match original {
                Some(original) => {
                    ensure_parent(&target)?;
                    if let Err(err) = fs::hard_link(&original, &target) {
                        progress.add_error(OperationError::new(target.clone(), err.to_string()));
                    }
                }
                None => {
                    progress.add_error(OperationError::new(
                        target.clone(),
                        "hard link member with unsafe target",
                    ));
                }
            }
        } else if entry_type.is_file() {
            ensure_parent(&target)?;
            let mut out = File::create(&target).map_err(|e| OpsError::io(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| OpsError::io(&target, e))?;
            drop(out);
            apply_file_metadata(&target, mode, mtime, progress);
        } else {
            progress.add_error(OperationError::new(
                target.clone(),
                format!("unsupported member type {:?}", entry_type),
            ));
        }

        progress.complete_item();
        progress.add_bytes(size);
        context.send_progress(progress);
    }

    apply_dir_fixups(fixups, progress);
    Ok(JobState::Completed)
}

fn extract_zip(
    context: &RunnerContext,
    archive_path: &Path,
    destination: &Path,
    progress: &mut OperationProgress,
) -> Result<JobState, OpsError> {
    let file = File::open(archive_path).map_err(|e| OpsError::io(archive_path, e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| OpsError::archive(archive_path, e.to_string()))?;
    let mut fixups: Vec<DirFixup> = Vec::new();

    for index in 0..archive.len() {
        if context.is_cancelled() {
            apply_dir_fixups(fixups, progress);
            return Ok(JobState::Cancelled);
        }
        let mut entry = archive
            .by_index(index)
            .map_err(|e| OpsError::archive(archive_path, e.to_string()))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(member = entry.name(), "unsafe archive member ignored");
            progress.add_error(OperationError::new(
                PathBuf::from(entry.name()),
                "unsafe member path ignored",
            ));
            progress.complete_item();
            continue;
        };
        let target = destination.join(relative);
        progress.set_current(Some(target.clone()));
        context.send_progress(progress);

        let mode = entry.unix_mode();
        let mtime = entry.last_modified().and_then(zip_mtime_seconds);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| OpsError::io(&target, e))?;
            fixups.push(DirFixup {
                path: target,
                mode,
                mtime,
            });
        } else {
            ensure_parent(&target)?;
            let mut out = File::create(&target).map_err(|e| OpsError::io(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| OpsError::io(&target, e))?;
            drop(out);
            apply_file_metadata(&target, mode, mtime, progress);
        }

        let size = entry.size();
        progress.complete_item();
        progress.add_bytes(size);
        context.send_progress(progress);
    }

    apply_dir_fixups(fixups, progress);
    Ok(JobState::Completed)
}

fn ensure_parent(target: &Path) -> Result<(), OpsError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| OpsError::io(parent, e))?;
    }
    Ok(())
}

/// Restore the permission bits and timestamp recorded in an archive entry.
fn apply_file_metadata(
    path: &Path,
    mode: Option<u32>,
    mtime: Option<i64>,
    progress: &mut OperationProgress,
) {
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
            progress.add_error(OperationError::new(
                path.to_path_buf(),
                format!("mode not restored: {err}"),
            ));
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    if let Some(secs) = mtime {
        let mtime = FileTime::from_unix_time(secs, 0);
        if let Err(err) = filetime::set_file_times(path, mtime, mtime) {
            progress.add_error(OperationError::new(
                path.to_path_buf(),
                format!("timestamp not restored: {err}"),
            ));
        }
    }
}

/// Apply deferred directory metadata deepest-first, mirroring the
/// children-before-parent ordering of creation and removal.
fn apply_dir_fixups(mut fixups: Vec<DirFixup>, progress: &mut OperationProgress) {
    fixups.sort_by_key(|fixup| std::cmp::Reverse(fixup.path.components().count()));
    for fixup in fixups {
        apply_file_metadata(&fixup.path, fixup.mode, fixup.mtime, progress);
    }
}

fn zip_mtime_seconds(datetime: zip::DateTime) -> Option<i64> {
    let date = chrono::NaiveDate::from_ymd_opt(
        i32::from(datetime.year()),
        u32::from(datetime.month()),
        u32::from(datetime.day()),
    )?;
    let time = date.and_hms_opt(
        u32::from(datetime.hour()),
        u32::from(datetime.minute()),
        u32::from(datetime.second()),
    )?;
    Some(time.and_utc().timestamp())
}

#[cfg(unix)]
fn make_symlink(target: &Path, dest: &Path) -> Result<(), OpsError> {
    std::os::unix::fs::symlink(target, dest).map_err(|e| OpsError::io(dest, e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, dest: &Path) -> Result<(), OpsError> {
    Err(OpsError::Unsupported {
        path: dest.to_path_buf(),
        message: "symlink extraction is not supported on this platform".to_string(),
    })
}
