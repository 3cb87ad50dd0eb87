//! Facade that runs many downloads and uploads at once.
//!
//! # Architecture
//!
//! ```text
//!  TransferManager ──commands──► manager task
//!                                  │
//!                                  ├── download ResourceManagers, one per (DC, small?)
//!                                  ├── upload ResourceManager
//!                                  └── nodes: query id ─► FileLoader task
//!                                                              │
//!                 TransferCallback ◄──── events (node id) ─────┘
//! ```
//!
//! Every request is identified by a caller-chosen [`QueryId`]. The manager
//! reports exactly one terminal event per query: `on_download_ok`,
//! `on_upload_ok`, or `on_error`. Cancelling a query reports
//! [`TransferError::Canceled`]; closing the manager reports
//! [`TransferError::Aborted`] for everything still running.
//!
//! When a [`ProgressStore`] is configured, partial progress is persisted on
//! every update and picked up again by later requests for the same file.

mod actor;

use crate::config::TransferConfig;
use crate::crypto::FileCipher;
use crate::error::TransferError;
use crate::loader::Progress;
use crate::location::{
    FileEncryptionKey, FileType, FullLocalLocation, FullRemoteLocation, LocalLocation,
    PartialLocalLocation, PartialRemoteLocation, RemoteLocation,
};
use crate::net::Transport;
use crate::store::ProgressStore;
use actor::{Command, ManagerActor};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Caller-chosen identifier of one transfer request.
pub type QueryId = u64;

/// Receives transfer events from the manager.
///
/// Calls come from the manager task; implementations should return quickly.
pub trait TransferCallback: Send + Sync + 'static {
    fn on_start_download(&self, _query_id: QueryId) {}

    fn on_progress(&self, _query_id: QueryId, _progress: &Progress) {}

    fn on_partial_download(
        &self,
        _query_id: QueryId,
        _partial: &PartialLocalLocation,
        _ready_size: i64,
        _size: i64,
    ) {
    }

    fn on_partial_upload(&self, _query_id: QueryId, _partial: &PartialRemoteLocation, _ready_size: i64) {
    }

    fn on_download_ok(
        &self,
        query_id: QueryId,
        location: FullLocalLocation,
        size: i64,
        is_new: bool,
    );

    fn on_upload_ok(
        &self,
        query_id: QueryId,
        file_type: FileType,
        partial: PartialRemoteLocation,
        size: i64,
    );

    fn on_error(&self, query_id: QueryId, error: TransferError);
}

/// Collaborators the manager is built from.
pub struct TransferContext {
    pub config: TransferConfig,
    pub transport: Arc<dyn Transport>,
    pub cipher: Option<Arc<dyn FileCipher>>,
    pub store: Option<Arc<dyn ProgressStore>>,
}

impl TransferContext {
    pub fn new(config: TransferConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            cipher: None,
            store: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn FileCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// A download request.
#[derive(Clone, Debug)]
pub struct DownloadParams {
    pub remote: FullRemoteLocation,
    /// Where to resume from; `Empty` consults the progress store.
    pub local: LocalLocation,
    /// Size in bytes, 0 if unknown.
    pub size: i64,
    /// Suggested file name for the published file.
    pub name: String,
    pub encryption_key: FileEncryptionKey,
    pub priority: i8,
    /// Streaming window start.
    pub offset: i64,
    /// Streaming window length, 0 for unlimited.
    pub limit: i64,
}

impl DownloadParams {
    pub fn new(remote: FullRemoteLocation, size: i64) -> Self {
        Self {
            remote,
            local: LocalLocation::Empty,
            size,
            name: String::new(),
            encryption_key: FileEncryptionKey::None,
            priority: 0,
            offset: 0,
            limit: 0,
        }
    }

    pub fn with_local(mut self, local: LocalLocation) -> Self {
        self.local = local;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_encryption_key(mut self, key: FileEncryptionKey) -> Self {
        self.encryption_key = key;
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_range(mut self, offset: i64, limit: i64) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// An upload request.
#[derive(Clone, Debug)]
pub struct UploadParams {
    pub file_type: FileType,
    pub local: LocalLocation,
    /// Where to resume from; `Empty` consults the progress store.
    pub remote: RemoteLocation,
    /// Size hint for files still being written.
    pub expected_size: i64,
    pub encryption_key: FileEncryptionKey,
    /// Parts the remote side reported missing.
    pub bad_parts: Vec<usize>,
    pub priority: i8,
}

impl UploadParams {
    pub fn new(file_type: FileType, local: LocalLocation) -> Self {
        Self {
            file_type,
            local,
            remote: RemoteLocation::Empty,
            expected_size: 0,
            encryption_key: FileEncryptionKey::None,
            bad_parts: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_remote(mut self, remote: RemoteLocation) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_expected_size(mut self, size: i64) -> Self {
        self.expected_size = size;
        self
    }

    pub fn with_encryption_key(mut self, key: FileEncryptionKey) -> Self {
        self.encryption_key = key;
        self
    }

    pub fn with_bad_parts(mut self, bad_parts: Vec<usize>) -> Self {
        self.bad_parts = bad_parts;
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }
}

/// Handle to the manager task.
///
/// Dropping the handle shuts the manager down like [`close`](Self::close)
/// without waiting for it.
pub struct TransferManager {
    commands: mpsc::UnboundedSender<Command>,
    join: JoinHandle<()>,
}

impl TransferManager {
    /// Spawns the manager on the current runtime.
    pub fn start(ctx: TransferContext, callback: Arc<dyn TransferCallback>) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let actor = ManagerActor::new(ctx, callback, inbox);
        let join = tokio::spawn(actor.run());
        Self { commands, join }
    }

    pub fn download(&self, query_id: QueryId, params: DownloadParams) {
        self.send(Command::Download {
            query_id,
            params: Box::new(params),
        });
    }

    pub fn upload(&self, query_id: QueryId, params: UploadParams) {
        self.send(Command::Upload {
            query_id,
            params: Box::new(params),
        });
    }

    /// Stops a transfer; it reports [`TransferError::Canceled`].
    pub fn cancel(&self, query_id: QueryId) {
        self.send(Command::Cancel { query_id });
    }

    pub fn update_priority(&self, query_id: QueryId, priority: i8) {
        self.send(Command::UpdatePriority { query_id, priority });
    }

    /// Tells an upload its source file grew or was finished.
    pub fn update_local_file_location(&self, query_id: QueryId, local: LocalLocation) {
        self.send(Command::UpdateLocalLocation { query_id, local });
    }

    /// Moves a download's streaming window.
    pub fn update_downloaded_part(&self, query_id: QueryId, offset: i64, limit: i64) {
        self.send(Command::UpdateDownloadedPart {
            query_id,
            offset,
            limit,
        });
    }

    /// Aborts every live transfer and waits for all loaders to stop.
    pub async fn close(self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).is_ok() {
            let _ = done.await;
        }
        let _ = self.join.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("transfer manager is not running");
        }
    }
}
