//! Package archive handling (gzip-compressed tar).
//!
//! Every archive carries `plinth.toml` at its root. Entries must stay inside
//! the archive root: absolute paths, `..` components, and links resolving
//! outside the root are rejected before anything touches the disk.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use plinth_schema::{MANIFEST_FILE, Manifest};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Default cap on the total uncompressed size of one archive.
pub const DEFAULT_MAX_UNCOMPRESSED_BYTES: u64 = 256 * 1024 * 1024;

const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

/// Size limits enforced on fetch and extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    /// Maximum summed size of all file entries.
    pub max_uncompressed_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_uncompressed_bytes: DEFAULT_MAX_UNCOMPRESSED_BYTES,
        }
    }
}

/// Information about an extracted file
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    /// Path relative to extraction root
    pub relative_path: PathBuf,
    /// Absolute path on disk
    pub absolute_path: PathBuf,
    /// Whether this is an executable
    pub is_executable: bool,
}

/// Pack a directory into a deterministic archive.
///
/// Entries are sorted by name and carry fixed ownership and timestamps, so
/// packing the same tree twice yields identical bytes. `.git` is skipped.
///
/// # Errors
///
/// Fails if the directory cannot be walked or read.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| Error::Archive(format!("walking {}: {e}", dir.display())))?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| Error::Archive(e.to_string()))?;
        if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Validate an in-memory archive and return its manifest.
///
/// # Errors
///
/// Returns [`Error::Archive`] for unsafe entries, oversize content, or a
/// missing manifest, and [`Error::Parse`] for an invalid manifest.
pub fn inspect(bytes: &[u8], limits: ArchiveLimits) -> Result<Manifest> {
    inspect_reader(bytes, limits)
}

/// Validate an archive on disk and return its manifest.
///
/// # Errors
///
/// As [`inspect`], plus I/O errors opening the file.
pub fn inspect_file(path: &Path, limits: ArchiveLimits) -> Result<Manifest> {
    inspect_reader(BufReader::new(File::open(path)?), limits)
}

fn inspect_reader<R: Read>(reader: R, limits: ArchiveLimits) -> Result<Manifest> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut total = 0u64;
    let mut manifest = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(relative) = checked_entry(&entry)? else {
            continue;
        };
        total = add_size(total, entry.header().entry_type(), entry.size(), limits)?;

        if relative == Path::new(MANIFEST_FILE) && entry.header().entry_type().is_file() {
            if entry.size() > MAX_MANIFEST_BYTES {
                return Err(Error::Archive(format!("{MANIFEST_FILE} is too large")));
            }
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            manifest = Some(Manifest::from_toml_str(&text)?);
        }
    }

    manifest.ok_or_else(|| Error::Archive(format!("archive has no {MANIFEST_FILE} at its root")))
}

/// Extract an archive into `dest`, validating every entry first.
///
/// # Errors
///
/// Returns [`Error::Archive`] for unsafe entries or oversize content, and
/// I/O errors from the filesystem. `dest` may hold a partial tree on error.
pub fn unpack(archive_path: &Path, dest: &Path, limits: ArchiveLimits) -> Result<Vec<ExtractedFile>> {
    fs::create_dir_all(dest)?;
    let file = BufReader::new(File::open(archive_path)?);
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    let mut total = 0u64;
    let mut extracted = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(relative_path) = checked_entry(&entry)? else {
            continue;
        };
        let kind = entry.header().entry_type();
        total = add_size(total, kind, entry.size(), limits)?;

        if !entry.unpack_in(dest)? {
            return Err(Error::Archive(format!(
                "refused to unpack {}",
                relative_path.display()
            )));
        }
        if kind.is_dir() {
            continue;
        }
        let is_executable = entry
            .header()
            .mode()
            .map(|m| m & 0o111 != 0)
            .unwrap_or(false);
        extracted.push(ExtractedFile {
            absolute_path: dest.join(&relative_path),
            relative_path,
            is_executable,
        });
    }
    Ok(extracted)
}

fn add_size(total: u64, kind: EntryType, size: u64, limits: ArchiveLimits) -> Result<u64> {
    if !kind.is_file() {
        return Ok(total);
    }
    let total = total.saturating_add(size);
    if total > limits.max_uncompressed_bytes {
        return Err(Error::Archive(format!(
            "archive expands past the {} byte limit",
            limits.max_uncompressed_bytes
        )));
    }
    Ok(total)
}

/// Normalized relative path of a safe entry, or `None` for metadata entries.
fn checked_entry<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Option<PathBuf>> {
    let kind = entry.header().entry_type();
    if matches!(
        kind,
        EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName | EntryType::GNULongLink
    ) {
        return Ok(None);
    }

    let raw = entry.path()?;
    let relative = normalize(&raw).ok_or_else(|| {
        Error::Archive(format!("entry path escapes the archive root: {}", raw.display()))
    })?;
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }

    match kind {
        EntryType::Regular | EntryType::Continuous | EntryType::Directory => {}
        EntryType::Symlink | EntryType::Link => {
            let target = entry
                .link_name()?
                .ok_or_else(|| Error::Archive(format!("link {} has no target", relative.display())))?;
            // Symlinks resolve from their own directory, hard links from the root.
            let base = if kind == EntryType::Symlink {
                relative.parent().map(Path::to_path_buf).unwrap_or_default()
            } else {
                PathBuf::new()
            };
            if normalize(&base.join(&target)).is_none() {
                return Err(Error::Archive(format!(
                    "link {} points outside the archive: {}",
                    relative.display(),
                    target.display()
                )));
            }
        }
        other => {
            return Err(Error::Archive(format!(
                "unsupported entry type {other:?} at {}",
                relative.display()
            )));
        }
    }
    Ok(Some(relative))
}

/// Resolve `.` and `..` lexically; `None` if the path is absolute or climbs
/// above its starting point.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}
