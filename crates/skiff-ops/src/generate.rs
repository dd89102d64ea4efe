//! Lazy job generation: destination mapping and the depth-first tree walk.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use skiff_core::{EntryKind, FileEntry, OpsError};

use crate::conflict::{ConflictResolver, Decision};
use crate::job::Job;

/// Map each source onto its final destination path.
///
/// Sources nest under `destination` by base name when it names an existing
/// directory, when the raw argument ends with the path separator, or when
/// more than one source is given; otherwise `destination` is the final path
/// itself. Rejects a destination equal to, or nested inside, any source.
pub fn resolve_destinations(
    sources: &[PathBuf],
    destination: &Path,
) -> Result<Vec<(PathBuf, PathBuf)>, OpsError> {
    let nest = destination.is_dir()
        || destination
            .as_os_str()
            .to_string_lossy()
            .ends_with(MAIN_SEPARATOR)
        || sources.len() > 1;

    let mut pairs = Vec::with_capacity(sources.len());
    for source in sources {
        let dest = if nest {
            let name = source.file_name().ok_or_else(|| OpsError::InvalidOperation {
                src: source.clone(),
                destination: destination.to_path_buf(),
            })?;
            destination.join(name)
        } else {
            destination.to_path_buf()
        };
        if dest.starts_with(source) {
            return Err(OpsError::InvalidOperation {
                src: source.clone(),
                destination: dest,
            });
        }
        pairs.push((source.clone(), dest));
    }
    Ok(pairs)
}

#[derive(Debug)]
enum Frame {
    /// Visit a source path paired with its destination.
    Enter { source: PathBuf, dest: PathBuf },
    /// Post-step for a directory whose contents have all been visited.
    Leave { source: PathBuf },
}

/// Lazily walks the source trees and turns them into jobs.
///
/// Depth-first: a directory's `CreateDir` is yielded before any of its
/// children, and (when moving) its `RemoveSourceDir` after all of them.
/// Consumed exactly once; after yielding an error the iterator fuses.
#[derive(Debug)]
pub struct JobGenerator {
    frames: Vec<Frame>,
    resolver: ConflictResolver,
    moving: bool,
    done: bool,
}

impl JobGenerator {
    /// Plan a walk of `sources` into `destination`.
    pub fn new(
        sources: &[PathBuf],
        destination: &Path,
        moving: bool,
        resolver: ConflictResolver,
    ) -> Result<Self, OpsError> {
        let pairs = resolve_destinations(sources, destination)?;
        let mut frames = Vec::with_capacity(pairs.len());
        for (source, dest) in pairs.into_iter().rev() {
            frames.push(Frame::Enter { source, dest });
        }
        Ok(Self {
            frames,
            resolver,
            moving,
            done: false,
        })
    }

    fn step(&mut self) -> Result<Option<Job>, OpsError> {
        while let Some(frame) = self.frames.pop() {
            match frame {
                Frame::Leave { source } => {
                    return Ok(Some(Job::RemoveSourceDir { path: source }));
                }
                Frame::Enter { source, dest } => {
                    let entry = FileEntry::snapshot(&source)?;
                    match entry.kind {
                        EntryKind::Directory => {
                            if self.moving {
                                self.frames.push(Frame::Leave {
                                    source: source.clone(),
                                });
                            }
                            for name in read_dir_sorted(&source)?.into_iter().rev() {
                                self.frames.push(Frame::Enter {
                                    source: source.join(&name),
                                    dest: dest.join(&name),
                                });
                            }
                            // An existing destination directory is not a
                            // conflict; recursion merges into it.
                            if !dest.is_dir() {
                                return Ok(Some(Job::CreateDir {
                                    dest,
                                    template: entry,
                                }));
                            }
                        }
                        EntryKind::Symlink { .. } => {
                            return Ok(Some(Job::CopySymlink {
                                source: entry,
                                dest,
                            }));
                        }
                        _ => {
                            let existing = match FileEntry::snapshot(&dest) {
                                Ok(snapshot) => Some(snapshot),
                                Err(OpsError::NotFound { .. }) => None,
                                Err(err) => return Err(err),
                            };
                            match self.resolver.resolve(&entry, existing.as_ref())? {
                                Decision::Proceed => {
                                    return Ok(Some(Job::CopyFile {
                                        source: entry,
                                        dest,
                                    }));
                                }
                                Decision::Skip => continue,
                            }
                        }
                    }
                }
            }
        }
        Ok(None)
    }
}

impl Iterator for JobGenerator {
    type Item = Result<Job, OpsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(job)) => Some(Ok(job)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Directory entries in name order, so walks are stable and testable.
pub(crate) fn read_dir_sorted(dir: &Path) -> Result<Vec<OsString>, OpsError> {
    let mut names: Vec<OsString> = fs::read_dir(dir)
        .map_err(|e| OpsError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.file_name()))
        .collect();
    names.sort();
    Ok(names)
}
