//! Streaming tar extraction
//!
//! Reads the tar stream a container engine produces when copying a path
//! out of a container. Copying `/a/b` yields entries rooted at `b`, so
//! callers name that root when extracting.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive held no regular files
    #[error("Archive contained no files")]
    EmptyTarball,

    #[error("Archive exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { limit: u64 },

    #[error("Entry '{0}' not found in archive")]
    EntryNotFound(String),

    #[error("Refusing to extract unsafe path '{0}'")]
    UnsafePath(String),

    #[error("Failed to read archive: {0}")]
    Io(#[from] io::Error),
}

/// Summary of a multi-file extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extracted {
    pub files: usize,
    pub bytes: u64,
}

/// Tar archive read from any byte stream
pub struct Archive<R: Read> {
    inner: tar::Archive<R>,
}

impl<R: Read> Archive<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: tar::Archive::new(reader),
        }
    }

    /// Reads the entry called `name` into memory
    ///
    /// The whole archive is consumed so the producer is never left blocked.
    pub fn single_bytes(mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let wanted = normalize(Path::new(name));
        let mut found = None;
        let mut regular_files = 0usize;

        for entry in self.inner.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            regular_files += 1;

            let path = normalize(&entry.path()?);
            if found.is_none() && path == wanted {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                found = Some(buffer);
            }
        }

        match found {
            Some(buffer) => Ok(buffer),
            None if regular_files == 0 => Err(ArchiveError::EmptyTarball),
            None => Err(ArchiveError::EntryNotFound(name.to_string())),
        }
    }

    /// Extracts every entry below `root` into `dest`
    ///
    /// `root` is stripped from entry paths; entries outside it are skipped.
    /// Fails once the cumulative size of regular files would exceed
    /// `max_bytes`, and with [`ArchiveError::EmptyTarball`] when no regular
    /// file was found.
    pub fn multi(mut self, root: &str, dest: &Path, max_bytes: u64) -> Result<Extracted, ArchiveError> {
        let root = normalize(Path::new(root));
        let mut extracted = Extracted { files: 0, bytes: 0 };

        fs::create_dir_all(dest)?;

        for entry in self.inner.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let relative = match normalize(&path).strip_prefix(&root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };
            ensure_safe(&relative)?;
            ensure_no_symlink_parents(dest, &relative)?;

            let entry_type = entry.header().entry_type();
            let target = dest.join(&relative);

            if entry_type.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if !(entry_type.is_file() || entry_type.is_symlink()) {
                debug!("Skipping unsupported entry {}", path.display());
                continue;
            }

            if entry_type.is_file() {
                extracted.bytes = extracted
                    .bytes
                    .checked_add(entry.size())
                    .filter(|total| *total <= max_bytes)
                    .ok_or(ArchiveError::SizeLimitExceeded { limit: max_bytes })?;
                extracted.files += 1;
            } else {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| ArchiveError::UnsafePath(path.display().to_string()))?;
                ensure_link_inside(&relative, &link)?;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }

        if extracted.files == 0 {
            return Err(ArchiveError::EmptyTarball);
        }

        debug!(
            "Extracted {} file(s), {} bytes into {}",
            extracted.files,
            extracted.bytes,
            dest.display()
        );
        Ok(extracted)
    }
}

/// Drops `.` components and a leading `/`
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir))
        .collect()
}

fn ensure_safe(path: &Path) -> Result<(), ArchiveError> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ArchiveError::UnsafePath(path.display().to_string()));
    }
    Ok(())
}

/// Refuses to write through a symlink already present under `dest`
fn ensure_no_symlink_parents(dest: &Path, relative: &Path) -> Result<(), ArchiveError> {
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    let mut current = dest.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ArchiveError::UnsafePath(relative.display().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// A symlink at `relative` must resolve to a path below the extraction root
fn ensure_link_inside(relative: &Path, link: &Path) -> Result<(), ArchiveError> {
    let unsafe_link = || {
        ArchiveError::UnsafePath(format!("{} -> {}", relative.display(), link.display()))
    };
    let mut depth = relative.components().count().saturating_sub(1);
    for component in link.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => depth = depth.checked_sub(1).ok_or_else(unsafe_link)?,
            Component::RootDir | Component::Prefix(_) => return Err(unsafe_link()),
        }
    }
    Ok(())
}

/// Blocking reader fed with chunks from an async task
///
/// Lets synchronous tar extraction run on a blocking thread while the
/// container stream is still being copied. Must not be read from inside
/// the async runtime.
pub struct ChannelReader {
    receiver: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    position: usize,
}

impl ChannelReader {
    pub fn new(receiver: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            receiver,
            current: Vec::new(),
            position: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.current.len() {
            match self.receiver.blocking_recv() {
                Some(chunk) => {
                    self.current = chunk;
                    self.position = 0;
                }
                None => return Ok(0),
            }
        }

        let available = &self.current[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }
}
