//! Shared archive plumbing: container formats, entry naming, and extraction
//! path safety.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Archive container formats recognized by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    /// Detect the format from a file name. Compound tar extensions win over
    /// the plain suffix match.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Some(Self::TarGz);
        }
        if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            return Some(Self::TarBz2);
        }
        if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            return Some(Self::TarXz);
        }
        if name.ends_with(".tar") {
            return Some(Self::Tar);
        }
        if name.ends_with(".zip") {
            return Some(Self::Zip);
        }
        None
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
            Self::TarXz => "tar.xz",
            Self::Zip => "zip",
        }
    }

    /// Whether this is one of the tar family of formats.
    pub fn is_tar(&self) -> bool {
        !matches!(self, Self::Zip)
    }

    /// Whether entries can be appended to an existing archive in place.
    /// Compressed tar streams cannot be reopened for append.
    pub fn supports_append(&self) -> bool {
        matches!(self, Self::Tar | Self::Zip)
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Forward-slash archive name of `path` relative to `base`, under the
/// optional wrap folder.
pub(crate) fn entry_name(base: &Path, path: &Path, wrap: Option<&str>) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let mut parts: Vec<String> = Vec::new();
    if let Some(wrap) = wrap {
        if !wrap.is_empty() {
            parts.push(wrap.to_string());
        }
    }
    for component in relative.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_string_lossy().into_owned());
        }
    }
    parts.join("/")
}

/// Resolve an archive member path inside `dest_root`, rejecting absolute
/// paths and parent-directory components so an archive cannot escape the
/// extraction directory.
pub(crate) fn sanitize_extract_path(dest_root: &Path, raw: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(dest_root.join(clean))
}
