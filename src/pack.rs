//! Packaging of generator output into `<name>.tar` and `<name>.tar.gz`.
//!
//! The walk is depth-first in lexical order so the same tree always yields the
//! same entry sequence. When the source is a directory, every entry is nested
//! under the directory's own base name, so unpacking the result gives a single
//! top-level folder.
//!
//! Packaging is lenient: an entry that cannot be stat'ed or read, or that is
//! neither a regular file nor a directory, is logged and skipped. Failing to
//! write the archive itself is fatal.

use flate2::{Compression, GzBuilder};
use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tar::{Builder, EntryType, Header};
use tracing::{debug, info, warn};

use crate::error::{CompressError, OutputArchiveError, PackError};

/// Result of [`pack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArchive {
    pub path: PathBuf,
    pub entries: usize,
    pub skipped: usize,
}

/// Write `<target_dir>/<basename of source>.tar` containing `source`.
pub fn pack(source: &Path, target_dir: &Path) -> Result<PackedArchive, PackError> {
    let meta = fs::metadata(source).map_err(|e| PackError::Source {
        path: source.to_path_buf(),
        source: e,
    })?;
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let path = target_dir.join(format!("{base}.tar"));

    let file = File::create(&path).map_err(|source| PackError::Archive {
        path: path.clone(),
        source,
    })?;
    let mut walk = Walk {
        builder: Builder::new(BufWriter::new(file)),
        entries: 0,
        skipped: 0,
    };

    let result = if meta.is_dir() {
        walk.visit_dir(source, Path::new(&base), &meta)
    } else {
        walk.append_file(source, Path::new(&base), &meta)
    };
    result.map_err(|source| PackError::Archive {
        path: path.clone(),
        source,
    })?;

    let Walk {
        builder,
        entries,
        skipped,
    } = walk;
    builder
        .into_inner()
        .and_then(|mut writer| writer.flush())
        .map_err(|source| PackError::Archive {
            path: path.clone(),
            source,
        })?;

    if skipped > 0 {
        warn!(archive = %path.display(), skipped, "Some entries were left out of the archive");
    }
    info!(archive = %path.display(), entries, skipped, "Packed directory");
    Ok(PackedArchive {
        path,
        entries,
        skipped,
    })
}

/// Gzip `archive` into `<target_dir>/<archive file name>.gz`.
pub fn compress(archive: &Path, target_dir: &Path) -> Result<PathBuf, CompressError> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive.tar".to_string());
    let gz_path = target_dir.join(format!("{name}.gz"));
    let fail = |source| CompressError {
        path: archive.to_path_buf(),
        source,
    };

    let mut input = File::open(archive).map_err(fail)?;
    let output = File::create(&gz_path).map_err(fail)?;
    let mut encoder = GzBuilder::new()
        .filename(name.as_bytes())
        .write(BufWriter::new(output), Compression::default());
    io::copy(&mut input, &mut encoder).map_err(fail)?;
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .map_err(fail)?;

    info!(archive = %gz_path.display(), "Compressed archive");
    Ok(gz_path)
}

/// [`pack`] then [`compress`], both into `target_dir`.
pub fn pack_and_compress(source: &Path, target_dir: &Path) -> Result<PathBuf, OutputArchiveError> {
    let packed = pack(source, target_dir)?;
    Ok(compress(&packed.path, target_dir)?)
}

struct Walk<W: Write> {
    builder: Builder<W>,
    entries: usize,
    skipped: usize,
}

impl<W: Write> Walk<W> {
    /// Errors returned from here are archive write failures; anything wrong
    /// with the source tree is counted in `skipped` instead.
    fn visit_dir(&mut self, dir: &Path, name: &Path, meta: &Metadata) -> io::Result<()> {
        let mut header = header_for(meta, EntryType::Directory, 0);
        self.builder.append_data(&mut header, name, io::empty())?;
        self.entries += 1;

        let mut children = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir
                .filter_map(|child| match child {
                    Ok(child) => Some(child),
                    Err(e) => {
                        warn!(dir = %dir.display(), error = ?e, "Skipping unreadable directory entry");
                        self.skipped += 1;
                        None
                    }
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(dir = %dir.display(), error = ?e, "Skipping unreadable directory");
                self.skipped += 1;
                return Ok(());
            }
        };
        children.sort_by_key(|child| child.file_name());

        for child in children {
            let path = child.path();
            let child_name = name.join(child.file_name());
            let child_meta = match fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = ?e, "Skipping entry that vanished or cannot be stat'ed");
                    self.skipped += 1;
                    continue;
                }
            };
            if child_meta.is_dir() {
                self.visit_dir(&path, &child_name, &child_meta)?;
            } else if child_meta.is_file() {
                self.append_file(&path, &child_name, &child_meta)?;
            } else {
                warn!(path = %path.display(), "Skipping entry that is neither file nor directory");
                self.skipped += 1;
            }
        }
        Ok(())
    }

    fn append_file(&mut self, path: &Path, name: &Path, meta: &Metadata) -> io::Result<()> {
        // Read up front so a failing read never leaves a half-written entry.
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = ?e, "Skipping unreadable file");
                self.skipped += 1;
                return Ok(());
            }
        };
        let mut header = header_for(meta, EntryType::Regular, content.len() as u64);
        self.builder.append_data(&mut header, name, &content[..])?;
        debug!(entry = %name.display(), size = content.len(), "Packed file");
        self.entries += 1;
        Ok(())
    }
}

fn header_for(meta: &Metadata, kind: EntryType, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode_of(meta));
    header.set_uid(0);
    header.set_gid(0);
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    header.set_mtime(mtime);
    header
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
