//! Persistence of partial transfer progress.
//!
//! The store itself only keeps bytes under string keys. The engine derives
//! the keys from locations and encodes records with `bincode`, so a
//! transfer interrupted by a restart resumes from its last partial location.
//!
//! ```text
//! FullRemoteLocation ──sha256──► "dl-<hex>" ──► bincode(PartialLocalLocation)
//! local upload path  ──sha256──► "ul-<hex>" ──► bincode(PartialRemoteLocation)
//! ```

use crate::crypto::sha256;
use crate::location::{FullRemoteLocation, PartialLocalLocation, PartialRemoteLocation};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Key under which one transfer's progress is stored.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProgressKey(String);

impl ProgressKey {
    /// Key of a download, derived from the remote file identity.
    ///
    /// The file reference is excluded: it rotates without changing content.
    pub fn download(location: &FullRemoteLocation) -> Self {
        let mut identity = Vec::with_capacity(24);
        identity.extend_from_slice(&location.dc_id.0.to_le_bytes());
        identity.extend_from_slice(&location.id.to_le_bytes());
        identity.extend_from_slice(&location.access_hash.to_le_bytes());
        Self(format!("dl-{}", hex::encode(&sha256(&identity)[..16])))
    }

    /// Key of an upload, derived from the local source path.
    pub fn upload(path: &Path) -> Self {
        let identity = path.to_string_lossy();
        Self(format!("ul-{}", hex::encode(&sha256(identity.as_bytes())[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte storage collaborator.
pub trait ProgressStore: Send + Sync + 'static {
    fn get(&self, key: &ProgressKey) -> Option<Vec<u8>>;
    fn set(&self, key: &ProgressKey, value: Vec<u8>);
    fn clear(&self, key: &ProgressKey);
}

/// Encodes a record for storage.
pub fn encode_record<T: Serialize>(record: &T) -> Option<Vec<u8>> {
    bincode::serialize(record)
        .map_err(|e| warn!(error = %e, "failed to encode progress record"))
        .ok()
}

/// Decodes a stored record, treating garbage as absent.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    bincode::deserialize(bytes)
        .map_err(|e| warn!(error = %e, "discarding corrupt progress record"))
        .ok()
}

/// Typed access on top of a [`ProgressStore`].
pub(crate) fn load_download(
    store: &dyn ProgressStore,
    location: &FullRemoteLocation,
) -> Option<PartialLocalLocation> {
    decode_record(&store.get(&ProgressKey::download(location))?)
}

pub(crate) fn load_upload(store: &dyn ProgressStore, path: &Path) -> Option<PartialRemoteLocation> {
    decode_record(&store.get(&ProgressKey::upload(path))?)
}

// =============================================================================
// Implementations
// =============================================================================

/// Process-local store.
#[derive(Default)]
pub struct MemoryProgressStore {
    entries: DashMap<ProgressKey, Vec<u8>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, key: &ProgressKey) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &ProgressKey, value: Vec<u8>) {
        self.entries.insert(key.clone(), value);
    }

    fn clear(&self, key: &ProgressKey) {
        self.entries.remove(key);
    }
}

/// One file per key under a directory, replaced atomically.
///
/// Records are loaded when the store is opened and served from memory.
/// Changes reach the disk from a background task, in order, with queued
/// writes to the same key collapsed to the latest one. `open` must run
/// inside a tokio runtime.
pub struct FileProgressStore {
    entries: DashMap<ProgressKey, Vec<u8>>,
    writes: mpsc::UnboundedSender<WriteOp>,
}

enum WriteOp {
    Set(ProgressKey, Vec<u8>),
    Clear(ProgressKey),
    Flush(oneshot::Sender<()>),
}

impl FileProgressStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let entries = DashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match fs::read(&path) {
                Ok(bytes) => {
                    entries.insert(ProgressKey(stem.to_string()), bytes);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable progress record"),
            }
        }
        debug!(dir = %dir.display(), records = entries.len(), "progress store opened");

        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(dir, rx));
        Ok(Self { entries, writes })
    }

    /// Waits until every change made so far is on disk.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writes.send(WriteOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn send(&self, op: WriteOp) {
        if self.writes.send(op).is_err() {
            warn!("progress writer stopped; change kept in memory only");
        }
    }
}

impl ProgressStore for FileProgressStore {
    fn get(&self, key: &ProgressKey) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &ProgressKey, value: Vec<u8>) {
        self.entries.insert(key.clone(), value.clone());
        self.send(WriteOp::Set(key.clone(), value));
    }

    fn clear(&self, key: &ProgressKey) {
        if self.entries.remove(key).is_some() {
            self.send(WriteOp::Clear(key.clone()));
        }
    }
}

const RECORD_EXTENSION: &str = "progress";

fn record_path(dir: &Path, key: &ProgressKey) -> PathBuf {
    dir.join(format!("{}.{RECORD_EXTENSION}", key.as_str()))
}

async fn run_writer(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        let mut pending = HashMap::new();
        let mut waiters = Vec::new();
        let mut next = Some(op);
        while let Some(op) = next {
            match op {
                WriteOp::Set(key, value) => {
                    pending.insert(key, Some(value));
                }
                WriteOp::Clear(key) => {
                    pending.insert(key, None);
                }
                WriteOp::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        if !pending.is_empty() {
            let dir = dir.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || write_records(&dir, pending)).await {
                warn!(error = %e, "progress writer job failed");
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
    trace!("progress writer stopped");
}

fn write_records(dir: &Path, pending: HashMap<ProgressKey, Option<Vec<u8>>>) {
    for (key, value) in pending {
        let path = record_path(dir, &key);
        let result = match value {
            Some(value) => {
                let temp_path = path.with_extension("tmp");
                fs::write(&temp_path, value).and_then(|()| fs::rename(&temp_path, &path))
            }
            None => match fs::remove_file(&path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            warn!(key = %key, error = %e, "failed to persist progress");
        }
    }
}
