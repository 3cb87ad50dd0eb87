//! The manager task: owns loaders, resource managers, and persistence.

use super::{DownloadParams, QueryId, TransferCallback, TransferContext, UploadParams};
use crate::error::TransferError;
use crate::loader::{
    spawn_loader, DownloadCallback, DownloadRequest, Downloader, FileLoaderHandle, LoaderContext,
    Progress, UploadCallback, UploadRequest, Uploader,
};
use crate::location::{
    DcId, FileType, FullLocalLocation, LocalLocation, PartialLocalLocation,
    PartialRemoteLocation, RemoteLocation,
};
use crate::net::NetDispatcher;
use crate::resource::ResourceManagerHandle;
use crate::store::{encode_record, load_download, load_upload, ProgressKey, ProgressStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub(crate) enum Command {
    Download {
        query_id: QueryId,
        params: Box<DownloadParams>,
    },
    Upload {
        query_id: QueryId,
        params: Box<UploadParams>,
    },
    Cancel {
        query_id: QueryId,
    },
    UpdatePriority {
        query_id: QueryId,
        priority: i8,
    },
    UpdateLocalLocation {
        query_id: QueryId,
        local: LocalLocation,
    },
    UpdateDownloadedPart {
        query_id: QueryId,
        offset: i64,
        limit: i64,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Loader-internal node id; distinct from caller query ids so events from a
/// replaced loader can be told apart.
type NodeId = u64;

enum LoaderEvent {
    Start,
    Progress(Progress),
    PartialDownload {
        partial: PartialLocalLocation,
        ready_size: i64,
        size: i64,
    },
    PartialUpload {
        partial: PartialRemoteLocation,
        ready_size: i64,
    },
    DownloadOk {
        location: FullLocalLocation,
        size: i64,
        is_new: bool,
    },
    UploadOk {
        file_type: FileType,
        partial: PartialRemoteLocation,
        size: i64,
    },
    Error(TransferError),
}

/// Forwards one loader's callbacks to the manager, tagged with its node.
struct NodeCallback {
    node: NodeId,
    events: mpsc::UnboundedSender<(NodeId, LoaderEvent)>,
}

impl NodeCallback {
    fn send(&self, event: LoaderEvent) {
        let _ = self.events.send((self.node, event));
    }
}

impl DownloadCallback for NodeCallback {
    fn on_start(&mut self) {
        self.send(LoaderEvent::Start);
    }

    fn on_progress(&mut self, progress: &Progress) {
        self.send(LoaderEvent::Progress(progress.clone()));
    }

    fn on_partial_download(&mut self, partial: PartialLocalLocation, ready_size: i64, size: i64) {
        self.send(LoaderEvent::PartialDownload {
            partial,
            ready_size,
            size,
        });
    }

    fn on_ok(&mut self, location: FullLocalLocation, size: i64, is_new: bool) {
        self.send(LoaderEvent::DownloadOk {
            location,
            size,
            is_new,
        });
    }

    fn on_error(&mut self, error: TransferError) {
        self.send(LoaderEvent::Error(error));
    }
}

impl UploadCallback for NodeCallback {
    fn on_progress(&mut self, progress: &Progress) {
        self.send(LoaderEvent::Progress(progress.clone()));
    }

    fn on_partial_upload(&mut self, partial: PartialRemoteLocation, ready_size: i64) {
        self.send(LoaderEvent::PartialUpload {
            partial,
            ready_size,
        });
    }

    fn on_ok(&mut self, file_type: FileType, partial: PartialRemoteLocation, size: i64) {
        self.send(LoaderEvent::UploadOk {
            file_type,
            partial,
            size,
        });
    }

    fn on_error(&mut self, error: TransferError) {
        self.send(LoaderEvent::Error(error));
    }
}

enum NodeKind {
    Download {
        key: ProgressKey,
    },
    Upload {
        key: Option<ProgressKey>,
        params: UploadParams,
        restarted: bool,
    },
}

struct Node {
    query_id: QueryId,
    loader: FileLoaderHandle,
    kind: NodeKind,
}

pub(crate) struct ManagerActor {
    loader_ctx: LoaderContext,
    store: Option<Arc<dyn ProgressStore>>,
    callback: Arc<dyn TransferCallback>,

    upload_resources: ResourceManagerHandle,
    download_resources: HashMap<(DcId, bool), ResourceManagerHandle>,

    nodes: HashMap<NodeId, Node>,
    query_nodes: HashMap<QueryId, NodeId>,
    next_node: NodeId,
    stopping: Vec<JoinHandle<()>>,

    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<(NodeId, LoaderEvent)>,
    events_tx: mpsc::UnboundedSender<(NodeId, LoaderEvent)>,
}

impl ManagerActor {
    pub(crate) fn new(
        ctx: TransferContext,
        callback: Arc<dyn TransferCallback>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let config = Arc::new(ctx.config);
        let upload_resources =
            ResourceManagerHandle::spawn(config.upload.mode, config.upload.resource_limit);
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            loader_ctx: LoaderContext {
                config,
                dispatcher: Arc::new(NetDispatcher::new(ctx.transport)),
                cipher: ctx.cipher,
            },
            store: ctx.store,
            callback,
            upload_resources,
            download_resources: HashMap::new(),
            nodes: HashMap::new(),
            query_nodes: HashMap::new(),
            next_node: 1,
            stopping: Vec::new(),
            commands,
            events,
            events_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        let reply = loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Close { reply }) => break Some(reply),
                    Some(command) => self.on_command(command),
                    None => break None,
                },

                Some((node, event)) = self.events.recv() => self.on_event(node, event),
            }
        };

        self.tear_down().await;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Download { query_id, params } => self.on_download(query_id, *params),
            Command::Upload { query_id, params } => self.on_upload(query_id, *params),
            Command::Cancel { query_id } => self.on_cancel(query_id),
            Command::UpdatePriority { query_id, priority } => {
                if let Some(node) = self.node_for(query_id) {
                    node.loader.update_priority(priority);
                }
            }
            Command::UpdateLocalLocation { query_id, local } => {
                if let Some(node) = self.node_for(query_id) {
                    if let NodeKind::Upload { params, .. } = &mut node.kind {
                        params.local = local.clone();
                    }
                    node.loader.update_local_location(local);
                }
            }
            Command::UpdateDownloadedPart {
                query_id,
                offset,
                limit,
            } => {
                if let Some(node) = self.node_for(query_id) {
                    if matches!(node.kind, NodeKind::Download { .. }) {
                        node.loader.update_downloaded_part(offset, limit);
                    }
                }
            }
            Command::Close { .. } => {}
        }
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    fn on_download(&mut self, query_id: QueryId, params: DownloadParams) {
        if self.reject_duplicate(query_id) {
            return;
        }
        let key = ProgressKey::download(&params.remote);
        let mut local = params.local;
        if matches!(local, LocalLocation::Empty) {
            if let Some(partial) = self
                .store
                .as_deref()
                .and_then(|store| load_download(store, &params.remote))
            {
                debug!(query_id, key = %key, "resuming download from store");
                local = LocalLocation::Partial(partial);
            }
        }

        let config = &self.loader_ctx.config;
        let is_small = params.size > 0 && params.size < config.download.small_file_threshold;
        let dc_id = params.remote.dc_id;
        let resources = self
            .download_resources
            .entry((dc_id, is_small))
            .or_insert_with(|| {
                ResourceManagerHandle::spawn(config.download.mode, config.download.resource_limit)
            })
            .clone();

        let node = self.allocate_node();
        let backend = Downloader::new(
            DownloadRequest {
                remote: params.remote,
                local,
                size: params.size,
                name: params.name,
                encryption_key: params.encryption_key,
                is_small,
                offset: params.offset,
                limit: params.limit,
            },
            Box::new(self.node_callback(node)),
            Arc::clone(&self.loader_ctx.config),
            self.loader_ctx.cipher.clone(),
        );
        let loader = spawn_loader(backend, self.loader_ctx.clone(), &resources, params.priority);
        self.insert_node(node, query_id, loader, NodeKind::Download { key });
        info!(query_id, node, dc = %dc_id, size = params.size, small = is_small, "download started");
    }

    fn on_upload(&mut self, query_id: QueryId, params: UploadParams) {
        if self.reject_duplicate(query_id) {
            return;
        }
        let key = params.local.path().map(|path| ProgressKey::upload(path));
        let mut remote = params.remote.clone();
        if matches!(remote, RemoteLocation::Empty) {
            let stored = self
                .store
                .as_deref()
                .zip(params.local.path())
                .and_then(|(store, path)| load_upload(store, path));
            if let Some(partial) = stored {
                debug!(query_id, ready = partial.ready_part_count, "resuming upload from store");
                remote = RemoteLocation::Partial(partial);
            }
        }
        self.start_upload(query_id, params, remote, key, false);
    }

    fn start_upload(
        &mut self,
        query_id: QueryId,
        params: UploadParams,
        remote: RemoteLocation,
        key: Option<ProgressKey>,
        restarted: bool,
    ) {
        let node = self.allocate_node();
        let backend = Uploader::new(
            UploadRequest {
                file_type: params.file_type,
                local: params.local.clone(),
                remote,
                expected_size: params.expected_size,
                encryption_key: params.encryption_key.clone(),
                bad_parts: if restarted {
                    Vec::new()
                } else {
                    params.bad_parts.clone()
                },
            },
            Box::new(self.node_callback(node)),
            Arc::clone(&self.loader_ctx.config),
            self.loader_ctx.cipher.clone(),
        );
        let loader = spawn_loader(
            backend,
            self.loader_ctx.clone(),
            &self.upload_resources,
            params.priority,
        );
        info!(query_id, node, restarted, "upload started");
        self.insert_node(
            node,
            query_id,
            loader,
            NodeKind::Upload {
                key,
                params,
                restarted,
            },
        );
    }

    fn on_cancel(&mut self, query_id: QueryId) {
        let Some(&node) = self.query_nodes.get(&query_id) else {
            trace!(query_id, "cancel for unknown query");
            return;
        };
        self.close_node(node);
        debug!(query_id, "transfer cancelled");
        self.callback.on_error(query_id, TransferError::Canceled);
    }

    // -------------------------------------------------------------------------
    // Loader events
    // -------------------------------------------------------------------------

    fn on_event(&mut self, node_id: NodeId, event: LoaderEvent) {
        let Some(node) = self.nodes.get(&node_id) else {
            trace!(node = node_id, "event from closed loader ignored");
            return;
        };
        let query_id = node.query_id;

        match event {
            LoaderEvent::Start => self.callback.on_start_download(query_id),
            LoaderEvent::Progress(progress) => self.callback.on_progress(query_id, &progress),
            LoaderEvent::PartialDownload {
                partial,
                ready_size,
                size,
            } => {
                if let NodeKind::Download { key } = &node.kind {
                    self.persist(key, &partial);
                }
                self.callback
                    .on_partial_download(query_id, &partial, ready_size, size);
            }
            LoaderEvent::PartialUpload {
                partial,
                ready_size,
            } => {
                if let NodeKind::Upload { key: Some(key), .. } = &node.kind {
                    self.persist(key, &partial);
                }
                self.callback
                    .on_partial_upload(query_id, &partial, ready_size);
            }
            LoaderEvent::DownloadOk {
                location,
                size,
                is_new,
            } => {
                if let Some(kind) = self.close_node(node_id) {
                    self.forget(&kind);
                }
                self.callback
                    .on_download_ok(query_id, location, size, is_new);
            }
            LoaderEvent::UploadOk {
                file_type,
                partial,
                size,
            } => {
                if let Some(kind) = self.close_node(node_id) {
                    self.forget(&kind);
                }
                self.callback
                    .on_upload_ok(query_id, file_type, partial, size);
            }
            LoaderEvent::Error(error) => self.on_loader_error(node_id, query_id, error),
        }
    }

    fn on_loader_error(&mut self, node_id: NodeId, query_id: QueryId, error: TransferError) {
        let Some(kind) = self.close_node(node_id) else {
            return;
        };

        let restartable = matches!(
            error,
            TransferError::UploadRestart | TransferError::InvalidPartSize { .. }
        );
        let kind = match kind {
            NodeKind::Upload {
                key,
                params,
                restarted: false,
            } if restartable => {
                warn!(query_id, error = %error, "restarting upload from scratch");
                if let (Some(store), Some(key)) = (&self.store, &key) {
                    store.clear(key);
                }
                self.start_upload(query_id, params, RemoteLocation::Empty, key, true);
                return;
            }
            kind => kind,
        };
        if error.is_integrity() {
            self.forget(&kind);
        }

        self.callback.on_error(query_id, error);
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    fn allocate_node(&mut self) -> NodeId {
        let node = self.next_node;
        self.next_node += 1;
        node
    }

    fn node_callback(&self, node: NodeId) -> NodeCallback {
        NodeCallback {
            node,
            events: self.events_tx.clone(),
        }
    }

    fn node_for(&mut self, query_id: QueryId) -> Option<&mut Node> {
        let node = self.query_nodes.get(&query_id)?;
        self.nodes.get_mut(node)
    }

    fn reject_duplicate(&self, query_id: QueryId) -> bool {
        if !self.query_nodes.contains_key(&query_id) {
            return false;
        }
        warn!(query_id, "query id already in use");
        self.callback.on_error(
            query_id,
            TransferError::Internal(format!("query {query_id} is already active")),
        );
        true
    }

    fn insert_node(&mut self, node: NodeId, query_id: QueryId, loader: FileLoaderHandle, kind: NodeKind) {
        self.query_nodes.insert(query_id, node);
        self.nodes.insert(
            node,
            Node {
                query_id,
                loader,
                kind,
            },
        );
    }

    /// Removes a node and stops its loader.
    fn close_node(&mut self, node_id: NodeId) -> Option<NodeKind> {
        let Node {
            query_id,
            loader,
            kind,
        } = self.nodes.remove(&node_id)?;
        if self.query_nodes.get(&query_id) == Some(&node_id) {
            self.query_nodes.remove(&query_id);
        }
        self.stopping.retain(|join| !join.is_finished());
        self.stopping.push(loader.shutdown());
        Some(kind)
    }

    fn persist<T: Serialize>(&self, key: &ProgressKey, record: &T) {
        if let (Some(store), Some(bytes)) = (&self.store, encode_record(record)) {
            store.set(key, bytes);
        }
    }

    fn forget(&self, kind: &NodeKind) {
        let key = match kind {
            NodeKind::Download { key } => Some(key),
            NodeKind::Upload { key, .. } => key.as_ref(),
        };
        if let (Some(store), Some(key)) = (&self.store, key) {
            store.clear(key);
        }
    }

    async fn tear_down(&mut self) {
        let nodes: Vec<NodeId> = self.nodes.keys().copied().collect();
        if !nodes.is_empty() {
            info!(live = nodes.len(), "aborting live transfers");
        }
        for node_id in nodes {
            if let Some(query_id) = self.nodes.get(&node_id).map(|node| node.query_id) {
                self.close_node(node_id);
                self.callback.on_error(query_id, TransferError::Aborted);
            }
        }
        futures::future::join_all(self.stopping.drain(..)).await;
        debug!("transfer manager stopped");
    }
}
