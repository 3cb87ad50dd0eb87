//! Lazily opened file handle with idle release.
//!
//! The handle is opened on first use and closed again once it has been idle
//! for `idle_timeout`, which bounds the number of descriptors held by many
//! concurrent, mostly-waiting transfers. It is shared between the loader task
//! and blocking part-preparation jobs.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FileMode {
    Read,
    Write,
}

struct Inner {
    path: PathBuf,
    mode: FileMode,
    file: Option<File>,
    last_used: Instant,
    idle_timeout: Duration,
}

impl Inner {
    fn acquire(&mut self) -> io::Result<&mut File> {
        self.last_used = Instant::now();
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = match self.mode {
                    FileMode::Read => File::open(&self.path)?,
                    FileMode::Write => OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&self.path)?,
                };
                trace!(path = %self.path.display(), "file opened");
                file
            }
        };
        Ok(self.file.insert(file))
    }
}

#[derive(Clone)]
pub(crate) struct LazyFile {
    inner: Arc<Mutex<Inner>>,
}

impl LazyFile {
    pub(crate) fn new(path: impl Into<PathBuf>, mode: FileMode, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                path: path.into(),
                mode,
                file: None,
                last_used: Instant::now(),
                idle_timeout,
            })),
        }
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    pub(crate) fn write_at(&self, offset: i64, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let file = inner.acquire()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)
    }

    /// Reads up to `len` bytes at `offset`; fewer at end of file.
    pub(crate) fn read_at(&self, offset: i64, len: usize) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let file = inner.acquire()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut data = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut data)?;
        Ok(data)
    }

    pub(crate) fn len(&self) -> io::Result<u64> {
        let path = self.path();
        std::fs::metadata(path).map(|m| m.len())
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        let inner = self.inner.lock();
        match &inner.file {
            Some(file) => file.sync_data(),
            None => Ok(()),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.lock().file.is_some()
    }

    /// When the open handle becomes idle; `None` if closed.
    pub(crate) fn idle_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        inner
            .file
            .as_ref()
            .map(|_| inner.last_used + inner.idle_timeout)
    }

    /// Closes the handle if it has been idle long enough.
    pub(crate) fn release_if_idle(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.file.is_some() && inner.last_used + inner.idle_timeout <= Instant::now() {
            inner.file = None;
            trace!(path = %inner.path.display(), "idle file closed");
            return true;
        }
        false
    }

    pub(crate) fn close(&self) {
        self.inner.lock().file = None;
    }
}

impl std::fmt::Debug for LazyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LazyFile")
            .field("path", &inner.path)
            .field("open", &inner.file.is_some())
            .finish()
    }
}

/// Returns `path` if free, else `stem (n).ext` for the first free `n`.
pub(crate) fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (1..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
