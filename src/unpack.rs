//! Unpacking of uploaded `.tar.gz` archives.
//!
//! The gzip layer is decoded lazily while tar entries are walked, so nothing
//! needs to be buffered beyond what the caller hands in. Only directories and
//! regular files are materialized; links and special files are skipped.
//!
//! Every entry path is checked before anything touches the disk: parent
//! references, absolute paths and drive prefixes are rejected outright, and
//! the canonical location of each directory written to must still sit below
//! the canonical extraction root.
//!
//! Permission bits are restored without setuid, setgid or sticky. Directories
//! always keep owner `rwx` so the tree stays removable by the service.

use flate2::read::GzDecoder;
use std::cell::Cell;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

use crate::error::ExtractError;

/// Counts of what an extraction produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    /// Entries of a kind that is never written (symlinks, devices, ...).
    pub skipped: usize,
}

/// Gzip reader that remembers whether decoding ever failed, so errors that
/// surface through the tar layer can be attributed to the right layer.
struct GzipSource<R> {
    decoder: GzDecoder<R>,
    failed: Rc<Cell<bool>>,
}

impl<R: Read> Read for GzipSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(buf).map_err(|e| {
            self.failed.set(true);
            e
        })
    }
}

/// Owner bits every extracted directory keeps.
const OWNER_RWX: u32 = 0o700;

/// Decompress `compressed` and unpack it below `destination`, which must exist.
pub fn extract<R: Read>(compressed: R, destination: &Path) -> Result<ExtractSummary, ExtractError> {
    let root = destination
        .canonicalize()
        .map_err(|source| ExtractError::Io {
            path: destination.to_path_buf(),
            source,
        })?;

    let gzip_failed = Rc::new(Cell::new(false));
    let mut archive = Archive::new(GzipSource {
        decoder: GzDecoder::new(compressed),
        failed: gzip_failed.clone(),
    });
    let classify = |e: io::Error| {
        if gzip_failed.get() {
            ExtractError::Decompression(e)
        } else {
            ExtractError::ArchiveFormat(e.to_string())
        }
    };

    let mut summary = ExtractSummary::default();
    // Directory modes are applied last so a read-only directory cannot block
    // the files that belong inside it.
    let mut directory_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive.entries().map_err(classify)? {
        let mut entry = entry.map_err(classify)?;
        let raw_path = entry.path().map_err(classify)?.into_owned();
        let relative = contained_path(&raw_path)?;
        let header = entry.header();
        let kind = header.entry_type();
        let mode = header.mode().map_err(classify)?;
        let size = header.size().map_err(classify)?;
        let target = root.join(&relative);

        match kind {
            EntryType::Directory => {
                if relative.as_os_str().is_empty() {
                    continue;
                }
                fs::create_dir_all(&target).map_err(|source| fs_error(&target, source))?;
                ensure_inside(&root, &target, &raw_path)?;
                debug!(path = %relative.display(), mode = %format!("{mode:o}"), "Extracted directory");
                directory_modes.push((target, mode | OWNER_RWX));
                summary.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if relative.as_os_str().is_empty() {
                    return Err(ExtractError::ArchiveFormat(format!(
                        "file entry without a name: {}",
                        raw_path.display()
                    )));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|source| fs_error(parent, source))?;
                    ensure_inside(&root, parent, &raw_path)?;
                }
                write_file(&mut entry, &target, mode, size, &classify)?;
                debug!(path = %relative.display(), size, "Extracted file");
                summary.files += 1;
            }
            other => {
                warn!(path = %raw_path.display(), kind = ?other, "Skipping unsupported archive entry");
                summary.skipped += 1;
            }
        }
    }

    // The tar reader stops at the end-of-archive blocks; the gzip trailer
    // (CRC32 and length) is only verified once the stream is read to the end.
    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink()).map_err(classify)?;

    for (path, mode) in directory_modes.iter().rev() {
        set_mode(path, *mode)?;
    }

    info!(
        root = %root.display(),
        files = summary.files,
        directories = summary.directories,
        skipped = summary.skipped,
        "Archive extracted"
    );
    Ok(summary)
}

/// Strip `.` components and reject anything that could leave the root.
fn contained_path(raw: &Path) -> Result<PathBuf, ExtractError> {
    let mut relative = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                warn!(path = %raw.display(), "Rejecting archive entry outside extraction root");
                return Err(ExtractError::PathTraversal {
                    entry: raw.to_path_buf(),
                });
            }
        }
    }
    Ok(relative)
}

/// Entries that collide with each other (a file where a directory is needed,
/// or the other way round) are a malformed archive, not a server fault.
fn fs_error(path: &Path, source: io::Error) -> ExtractError {
    match source.kind() {
        io::ErrorKind::AlreadyExists
        | io::ErrorKind::NotADirectory
        | io::ErrorKind::IsADirectory => ExtractError::ArchiveFormat(format!(
            "conflicting entry at {}: {source}",
            path.display()
        )),
        _ => ExtractError::Io {
            path: path.to_path_buf(),
            source,
        },
    }
}

fn ensure_inside(root: &Path, dir: &Path, entry: &Path) -> Result<(), ExtractError> {
    let resolved = dir.canonicalize().map_err(|source| ExtractError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        warn!(
            path = %entry.display(),
            resolved = %resolved.display(),
            "Archive entry resolves outside extraction root"
        );
        Err(ExtractError::PathTraversal {
            entry: entry.to_path_buf(),
        })
    }
}

fn write_file<R: Read>(
    entry: &mut R,
    target: &Path,
    mode: u32,
    size: u64,
    classify: &dyn Fn(io::Error) -> ExtractError,
) -> Result<(), ExtractError> {
    let io_err = |source| ExtractError::Io {
        path: target.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)
        .map_err(|source| fs_error(target, source))?;

    let mut buf = [0u8; 64 * 1024];
    let mut copied: u64 = 0;
    while copied < size {
        let want = (size - copied).min(buf.len() as u64) as usize;
        let n = entry.read(&mut buf[..want]).map_err(classify)?;
        if n == 0 {
            return Err(ExtractError::ArchiveFormat(format!(
                "entry {} truncated after {copied} of {size} bytes",
                target.display()
            )));
        }
        file.write_all(&buf[..n]).map_err(io_err)?;
        copied += n as u64;
    }
    file.flush().map_err(io_err)?;
    drop(file);

    set_mode(target, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ExtractError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)).map_err(|source| {
        ExtractError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ExtractError> {
    Ok(())
}
