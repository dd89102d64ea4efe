//! Archive creation runners (tar family and zip).
//!
//! A pre-pass walks the sources to fix the entry total for the `(n/total)`
//! display; the write loop then adds one entry per step, observing
//! cancellation between entries.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bzip2::write::BzEncoder;
use chrono::{Datelike, Timelike};
use filetime::FileTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xz2::write::XzEncoder;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use skiff_core::{FileEntry, OpsError};

use crate::archive::{entry_name, ArchiveFormat};
use crate::progress::{OperationKind, OperationProgress};
use crate::runner::{error_record, JobHandle, JobState, RunnerContext};

/// How an existing destination archive is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CreateMode {
    /// Fail if the destination already exists.
    #[default]
    Create,
    /// Append entries to the existing archive. Plain tar and zip only.
    Add,
    /// Replace the existing archive.
    Overwrite,
}

/// Options for pack operations.
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Behavior when the destination archive already exists.
    pub mode: CreateMode,
    /// Optional folder name wrapped around every entry inside the archive.
    pub wrap: Option<String>,
}

/// Start a background pack of `sources` into the archive at `destination`.
pub fn start_pack(
    format: ArchiveFormat,
    sources: Vec<PathBuf>,
    destination: PathBuf,
    options: PackOptions,
) -> JobHandle {
    let kind = if format.is_tar() {
        OperationKind::Tar
    } else {
        OperationKind::Zip
    };
    let (context, handle) = RunnerContext::channel(kind);
    tokio::task::spawn_blocking(move || {
        pack_worker(context, format, sources, destination, options);
    });
    handle
}

/// One planned archive entry from the pre-pass.
#[derive(Debug)]
struct PackItem {
    source: PathBuf,
    name: String,
    is_dir: bool,
    size: u64,
}

fn pack_worker(
    context: RunnerContext,
    format: ArchiveFormat,
    sources: Vec<PathBuf>,
    destination: PathBuf,
    options: PackOptions,
) {
    context.set_running();

    let items = match collect_items(&sources, options.wrap.as_deref()) {
        Ok(items) => items,
        Err(err) => {
            let mut progress = OperationProgress::new(context.kind, 0, 0);
            progress.add_error(error_record(&err));
            context.finish(JobState::Failed, progress);
            return;
        }
    };
    let bytes_total = items.iter().map(|item| item.size).sum();
    let mut progress = OperationProgress::new(context.kind, items.len(), bytes_total);

    let state = match write_archive(
        &context,
        format,
        &items,
        &destination,
        options.mode,
        &mut progress,
    ) {
        Ok(state) => state,
        Err(err) => {
            progress.add_error(error_record(&err));
            JobState::Failed
        }
    };

    // Keep the archive's own mtime meaningful when it packs a single tree.
    if state == JobState::Completed {
        if let [source] = sources.as_slice() {
            copy_source_mtime(source, &destination);
        }
    }

    context.finish(state, progress);
}

/// Walk the sources depth-first (directories before their children) and plan
/// one entry per path.
fn collect_items(sources: &[PathBuf], wrap: Option<&str>) -> Result<Vec<PackItem>, OpsError> {
    let mut items = Vec::new();
    for source in sources {
        let base = source.parent().unwrap_or_else(|| Path::new(""));
        for entry in jwalk::WalkDir::new(source)
            .skip_hidden(false)
            .follow_links(false)
            .sort(true)
        {
            let entry = entry.map_err(|e| OpsError::archive(source, e.to_string()))?;
            let path = entry.path();
            let metadata =
                fs::symlink_metadata(&path).map_err(|e| OpsError::io(&path, e))?;
            let name = entry_name(base, &path, wrap);
            if name.is_empty() {
                continue;
            }
            items.push(PackItem {
                source: path,
                name,
                is_dir: metadata.is_dir(),
                size: if metadata.is_file() { metadata.len() } else { 0 },
            });
        }
    }
    Ok(items)
}

fn write_archive(
    context: &RunnerContext,
    format: ArchiveFormat,
    items: &[PackItem],
    destination: &Path,
    mode: CreateMode,
    progress: &mut OperationProgress,
) -> Result<JobState, OpsError> {
    let exists = destination.exists();
    match mode {
        CreateMode::Create if exists => {
            return Err(OpsError::archive(destination, "destination already exists"));
        }
        CreateMode::Add if exists && !format.supports_append() => {
            return Err(OpsError::archive(
                destination,
                format!("cannot append to a {} archive", format.display_name()),
            ));
        }
        CreateMode::Overwrite if exists => {
            fs::remove_file(destination).map_err(|e| OpsError::io(destination, e))?;
        }
        _ => {}
    }
    let appending = exists && mode == CreateMode::Add;

    match format {
        ArchiveFormat::Zip => write_zip(context, items, destination, appending, progress),
        ArchiveFormat::Tar => {
            let file = if appending {
                open_tar_for_append(destination)?
            } else {
                File::create(destination).map_err(|e| OpsError::io(destination, e))?
            };
            let mut builder = tar::Builder::new(file);
            builder.follow_symlinks(false);
            let state = add_tar_entries(context, &mut builder, items, progress)?;
            builder
                .finish()
                .map_err(|e| OpsError::io(destination, e))?;
            Ok(state)
        }
        ArchiveFormat::TarGz => {
            let file = File::create(destination).map_err(|e| OpsError::io(destination, e))?;
            let mut builder =
                tar::Builder::new(GzEncoder::new(file, Compression::default()));
            builder.follow_symlinks(false);
            let state = add_tar_entries(context, &mut builder, items, progress)?;
            let encoder = builder
                .into_inner()
                .map_err(|e| OpsError::io(destination, e))?;
            encoder
                .finish()
                .map_err(|e| OpsError::io(destination, e))?;
            Ok(state)
        }
        ArchiveFormat::TarBz2 => {
            let file = File::create(destination).map_err(|e| OpsError::io(destination, e))?;
            let mut builder =
                tar::Builder::new(BzEncoder::new(file, bzip2::Compression::default()));
            builder.follow_symlinks(false);
            let state = add_tar_entries(context, &mut builder, items, progress)?;
            let encoder = builder
                .into_inner()
                .map_err(|e| OpsError::io(destination, e))?;
            encoder
                .finish()
                .map_err(|e| OpsError::io(destination, e))?;
            Ok(state)
        }
        ArchiveFormat::TarXz => {
            let file = File::create(destination).map_err(|e| OpsError::io(destination, e))?;
            let mut builder = tar::Builder::new(XzEncoder::new(file, 6));
            builder.follow_symlinks(false);
            let state = add_tar_entries(context, &mut builder, items, progress)?;
            let encoder = builder
                .into_inner()
                .map_err(|e| OpsError::io(destination, e))?;
            encoder
                .finish()
                .map_err(|e| OpsError::io(destination, e))?;
            Ok(state)
        }
    }
}

/// Open an existing plain tar positioned over its zero-block trailer, so new
/// entries stay visible to readers that stop at the first zero header.
fn open_tar_for_append(path: &Path) -> Result<File, OpsError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| OpsError::io(path, e))?;
    let len = file
        .metadata()
        .map_err(|e| OpsError::io(path, e))?
        .len();
    let trailer = len.min(1024);
    if trailer > 0 {
        file.seek(SeekFrom::End(-(trailer as i64)))
            .map_err(|e| OpsError::io(path, e))?;
        let mut tail = vec![0u8; trailer as usize];
        file.read_exact(&mut tail)
            .map_err(|e| OpsError::io(path, e))?;
        if tail.iter().all(|byte| *byte == 0) {
            file.seek(SeekFrom::End(-(trailer as i64)))
                .map_err(|e| OpsError::io(path, e))?;
        }
    }
    Ok(file)
}

fn add_tar_entries<W: Write>(
    context: &RunnerContext,
    builder: &mut tar::Builder<W>,
    items: &[PackItem],
    progress: &mut OperationProgress,
) -> Result<JobState, OpsError> {
    for item in items {
        if context.is_cancelled() {
            return Ok(JobState::Cancelled);
        }
        progress.set_current(Some(item.source.clone()));
        context.send_progress(progress);
        debug!(entry = %item.name, "adding tar entry");

        builder
            .append_path_with_name(&item.source, &item.name)
            .map_err(|e| OpsError::archive(&item.source, e.to_string()))?;

        progress.complete_item();
        progress.add_bytes(item.size);
        context.send_progress(progress);
    }
    Ok(JobState::Completed)
}

fn write_zip(
    context: &RunnerContext,
    items: &[PackItem],
    destination: &Path,
    appending: bool,
    progress: &mut OperationProgress,
) -> Result<JobState, OpsError> {
    let mut writer = if appending {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(destination)
            .map_err(|e| OpsError::io(destination, e))?;
        ZipWriter::new_append(file).map_err(|e| OpsError::archive(destination, e.to_string()))?
    } else {
        ZipWriter::new(File::create(destination).map_err(|e| OpsError::io(destination, e))?)
    };

    for item in items {
        if context.is_cancelled() {
            let _ = writer.finish();
            return Ok(JobState::Cancelled);
        }
        progress.set_current(Some(item.source.clone()));
        context.send_progress(progress);
        debug!(entry = %item.name, "adding zip entry");

        let entry = FileEntry::snapshot(&item.source)?;
        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(entry.permissions());
        if let Some(modified) = zip_datetime(&entry) {
            options = options.last_modified_time(modified);
        }

        if item.is_dir {
            writer
                .add_directory(item.name.clone(), options)
                .map_err(|e| OpsError::archive(&item.source, e.to_string()))?;
        } else {
            writer
                .start_file(item.name.clone(), options)
                .map_err(|e| OpsError::archive(&item.source, e.to_string()))?;
            // Zip stores file bodies, so symlinks are read through here.
            let mut source = File::open(&item.source).map_err(|e| OpsError::io(&item.source, e))?;
            io::copy(&mut source, &mut writer).map_err(|e| OpsError::io(&item.source, e))?;
        }

        progress.complete_item();
        progress.add_bytes(item.size);
        context.send_progress(progress);
    }

    writer
        .finish()
        .map_err(|e| OpsError::archive(destination, e.to_string()))?;
    Ok(JobState::Completed)
}

/// Map a snapshot's mtime into zip's DOS-era datetime, when representable.
fn zip_datetime(entry: &FileEntry) -> Option<zip::DateTime> {
    let datetime: chrono::DateTime<chrono::Local> = entry.mtime.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(datetime.year()).ok()?,
        datetime.month() as u8,
        datetime.day() as u8,
        datetime.hour() as u8,
        datetime.minute() as u8,
        datetime.second() as u8,
    )
    .ok()
}

fn copy_source_mtime(source: &Path, archive: &Path) {
    if let Ok(metadata) = fs::symlink_metadata(source) {
        if let Ok(modified) = metadata.modified() {
            let mtime = FileTime::from_system_time(modified);
            let _ = filetime::set_file_times(archive, mtime, mtime);
        }
    }
}
