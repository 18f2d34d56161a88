//! On-disk file materialization with out-of-order positional writes.
//!
//! Chunks of one file land in any order and from many tasks at once, so every
//! write is positional (`pwrite` on unix, `seek_write` on windows). Blocking
//! file I/O runs on tokio's blocking pool and is never aborted partway through.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::MaterializeError;

type Result<T> = std::result::Result<T, MaterializeError>;

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(unix)]
fn write_all_at(inner: &HandleInner, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    inner.file.write_all_at(buf, offset)
}

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(windows)]
fn write_all_at(inner: &HandleInner, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = inner
            .file
            .seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        written += n;
    }
    Ok(())
}

/// Seek-then-write under the handle's lock, for platforms without positional writes.
#[cfg(not(any(unix, windows)))]
fn write_all_at(inner: &HandleInner, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let _guard = inner
        .seek_lock
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut file = &inner.file;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// Opens output files beneath a root directory.
#[derive(Clone, Debug)]
pub struct FileMaterializer {
    root: PathBuf,
}

impl FileMaterializer {
    /// Materialize files beneath `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory all relative paths resolve against
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `relative` (and its parent directories) at exactly `total_size` bytes.
    ///
    /// Existing content is always discarded: the file is truncated and resized,
    /// so every chunk is fetched again even when the file already matches.
    pub async fn open(&self, relative: &Path, total_size: u64) -> Result<FileHandle> {
        let path = self.root.join(relative);
        let relative_path = relative.to_path_buf();

        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            if let Some(parent) = open_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&open_path)?;
            file.set_len(total_size)?;
            Ok(file)
        })
        .await
        .map_err(|e| MaterializeError::TaskFailed {
            path: relative_path.clone(),
            reason: e.to_string(),
        })?
        .map_err(|source| MaterializeError::Open {
            path: relative_path.clone(),
            source,
        })?;

        tracing::trace!(path = %relative_path.display(), total_size, "Opened output file");

        Ok(FileHandle {
            inner: Arc::new(HandleInner {
                file,
                path,
                relative_path,
                total_size,
                #[cfg(not(any(unix, windows)))]
                seek_lock: std::sync::Mutex::new(()),
            }),
        })
    }

    /// Create a directory entry (and its parents) beneath the root
    pub async fn create_dir(&self, relative: &Path) -> Result<PathBuf> {
        let path = self.root.join(relative);
        let target = path.clone();
        tokio::task::spawn_blocking(move || std::fs::create_dir_all(&target))
            .await
            .map_err(|e| MaterializeError::TaskFailed {
                path: relative.to_path_buf(),
                reason: e.to_string(),
            })?
            .map_err(|source| MaterializeError::Open {
                path: relative.to_path_buf(),
                source,
            })?;
        Ok(path)
    }
}

struct HandleInner {
    file: File,
    path: PathBuf,
    relative_path: PathBuf,
    total_size: u64,
    #[cfg(not(any(unix, windows)))]
    seek_lock: std::sync::Mutex<()>,
}

/// Open output file, shared by the chunk workers of one file.
///
/// Cheap to clone. The OS handle is released when the last clone drops, which
/// covers every exit path including cancellation and panics.
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<HandleInner>,
}

impl FileHandle {
    /// Path relative to the materializer root
    pub fn path(&self) -> &Path {
        &self.inner.relative_path
    }

    /// Declared size the file was opened with
    pub fn total_size(&self) -> u64 {
        self.inner.total_size
    }

    /// Write `bytes` at `offset`. Safe to call concurrently and in any order;
    /// rewriting the same bytes at the same offset is harmless.
    pub async fn write_at(&self, offset: u64, bytes: Vec<u8>) -> Result<()> {
        let len = bytes.len();
        let end = offset.checked_add(len as u64);
        if end.is_none_or(|end| end > self.inner.total_size) {
            return Err(MaterializeError::OutOfBounds {
                path: self.inner.relative_path.clone(),
                offset,
                len,
                total_size: self.inner.total_size,
            });
        }

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || write_all_at(&inner, &bytes, offset))
            .await
            .map_err(|e| MaterializeError::TaskFailed {
                path: self.inner.relative_path.clone(),
                reason: e.to_string(),
            })?
            .map_err(|source| MaterializeError::Write {
                path: self.inner.relative_path.clone(),
                offset,
                len,
                source,
            })
    }

    /// Mark the file executable (no-op off unix)
    pub async fn set_executable(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let mut perms = inner.file.metadata()?.permissions();
                perms.set_mode(perms.mode() | 0o111);
                std::fs::set_permissions(&inner.path, perms)
            })
            .await
            .map_err(|e| MaterializeError::TaskFailed {
                path: self.inner.relative_path.clone(),
                reason: e.to_string(),
            })?
            .map_err(|source| MaterializeError::Close {
                path: self.inner.relative_path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Flush file contents to disk. The OS handle is released when the last
    /// clone drops.
    pub async fn close(&self) -> Result<()> {
        let relative_path = self.inner.relative_path.clone();
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.file.sync_all())
            .await
            .map_err(|e| MaterializeError::TaskFailed {
                path: relative_path.clone(),
                reason: e.to_string(),
            })?
            .map_err(|source| MaterializeError::Close {
                path: relative_path,
                source,
            })
    }

    /// Release this handle and remove the partially written file.
    pub async fn discard(self) {
        let path = self.inner.path.clone();
        let relative_path = self.inner.relative_path.clone();
        drop(self);
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %relative_path.display(), error = %e, "Failed to remove partial file");
        }
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.inner.relative_path)
            .field("total_size", &self.inner.total_size)
            .finish()
    }
}
