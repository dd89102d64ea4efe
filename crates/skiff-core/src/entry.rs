//! Filesystem metadata snapshots.

use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use serde::{Deserialize, Serialize};

use crate::error::OpsError;

/// The kind of filesystem object a snapshot describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link, with its unresolved target string.
    Symlink { target: PathBuf },
    /// Named pipe.
    Fifo,
    /// Unix domain socket.
    Socket,
    /// Block device node.
    BlockDevice,
    /// Character device node.
    CharDevice,
}

/// An immutable metadata snapshot of one path.
///
/// Taken via `symlink_metadata` (links are never followed) when the job
/// generator visits the path, and never refreshed afterwards; prompts and
/// comparisons always describe the state at generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// The path the snapshot was taken from.
    pub path: PathBuf,
    /// What kind of object this is.
    pub kind: EntryKind,
    /// Size in bytes.
    pub size: u64,
    /// Full `st_mode` bits (type and permissions).
    pub mode: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Number of hard links.
    pub nlink: u64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

impl FileEntry {
    /// Snapshot a path without following symlinks.
    pub fn snapshot(path: impl Into<PathBuf>) -> Result<Self, OpsError> {
        let path = path.into();
        let metadata = fs::symlink_metadata(&path).map_err(|e| OpsError::io(&path, e))?;
        Ok(Self::from_metadata(path, &metadata))
    }

    /// Build a snapshot from already-fetched metadata.
    pub fn from_metadata(path: PathBuf, metadata: &fs::Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            let target = fs::read_link(&path).unwrap_or_default();
            EntryKind::Symlink { target }
        } else {
            classify(&file_type)
        };

        Self {
            path,
            kind,
            size: metadata.len(),
            mode: mode_of(metadata),
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            nlink: nlink_of(metadata),
            uid: uid_of(metadata),
            gid: gid_of(metadata),
        }
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    /// Check if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    /// Check if this is a symlink.
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }

    /// The final path component.
    pub fn file_name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    /// Strictly newer modification time than `other`.
    pub fn newer_than(&self, other: &FileEntry) -> bool {
        self.mtime > other.mtime
    }

    /// Permission bits only, without the file-type bits.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

#[cfg(unix)]
fn classify(file_type: &fs::FileType) -> EntryKind {
    if file_type.is_fifo() {
        EntryKind::Fifo
    } else if file_type.is_socket() {
        EntryKind::Socket
    } else if file_type.is_block_device() {
        EntryKind::BlockDevice
    } else if file_type.is_char_device() {
        EntryKind::CharDevice
    } else {
        EntryKind::File
    }
}

#[cfg(not(unix))]
fn classify(_file_type: &fs::FileType) -> EntryKind {
    EntryKind::File
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    metadata.mode()
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn nlink_of(metadata: &fs::Metadata) -> u64 {
    metadata.nlink()
}

#[cfg(not(unix))]
fn nlink_of(_metadata: &fs::Metadata) -> u64 {
    1
}

#[cfg(unix)]
fn uid_of(metadata: &fs::Metadata) -> u32 {
    metadata.uid()
}

#[cfg(not(unix))]
fn uid_of(_metadata: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn gid_of(metadata: &fs::Metadata) -> u32 {
    metadata.gid()
}

#[cfg(not(unix))]
fn gid_of(_metadata: &fs::Metadata) -> u32 {
    0
}
