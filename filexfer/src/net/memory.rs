//! In-process loopback transport.
//!
//! Uploaded parts are kept per file id; [`MemoryTransport::finish_upload`]
//! assembles them into a downloadable file, as a server would when the
//! upload is attached to a message.

use super::{Query, QueryResult, Request, Response, Transport, TransportFuture};
use crate::error::TransportError;
use crate::location::{DcId, FileType, FullRemoteLocation, PartialRemoteLocation};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Storage {
    uploads: HashMap<i64, BTreeMap<usize, Bytes>>,
    files: HashMap<i64, Bytes>,
}

/// Loopback server storing everything in memory.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    storage: Arc<Mutex<Storage>>,
    latency: Duration,
    next_file_id: Arc<AtomicI64>,
    requests: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Stores `data` as a downloadable file.
    pub fn publish(&self, file_type: FileType, data: Bytes) -> FullRemoteLocation {
        let id = self.next_file_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.storage.lock().files.insert(id, data);
        FullRemoteLocation {
            file_type,
            dc_id: DcId(1),
            id,
            access_hash: id.wrapping_mul(0x5851_f42d),
            file_reference: Vec::new(),
        }
    }

    /// Turns a completed upload into a downloadable file.
    ///
    /// Returns `None` if any part is missing.
    pub fn finish_upload(
        &self,
        file_type: FileType,
        partial: &PartialRemoteLocation,
        size: i64,
    ) -> Option<FullRemoteLocation> {
        let data = {
            let mut storage = self.storage.lock();
            let parts = storage.uploads.remove(&partial.file_id)?;
            if parts.len() < partial.part_count {
                storage.uploads.insert(partial.file_id, parts);
                return None;
            }
            let mut data = BytesMut::with_capacity(size.max(0) as usize);
            for part in 0..partial.part_count {
                data.extend_from_slice(parts.get(&part)?);
            }
            data.truncate(size.max(0) as usize);
            data.freeze()
        };
        Some(self.publish(file_type, data))
    }

    /// Number of requests served so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn serve(storage: &Mutex<Storage>, request: Request) -> QueryResult {
        match request {
            Request::GetFile {
                location,
                offset,
                limit,
                ..
            } => {
                let storage = storage.lock();
                let file = storage
                    .files
                    .get(&location.id)
                    .ok_or_else(|| TransportError::rpc(400, "FILE_ID_INVALID"))?;
                let begin = (offset.max(0) as usize).min(file.len());
                let end = (begin + limit.max(0) as usize).min(file.len());
                Ok(Response::File(file.slice(begin..end)))
            }
            Request::SaveFilePart { file_id, part, bytes }
            | Request::SaveBigFilePart {
                file_id,
                part,
                bytes,
                ..
            } => {
                storage
                    .lock()
                    .uploads
                    .entry(file_id)
                    .or_default()
                    .insert(part, bytes);
                Ok(Response::PartSaved(true))
            }
            _ => Err(TransportError::rpc(400, "METHOD_NOT_SUPPORTED")),
        }
    }
}

impl Transport for MemoryTransport {
    fn submit(&self, query: Query) -> TransportFuture {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let storage = Arc::clone(&self.storage);
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Self::serve(&storage, query.request)
        })
    }
}
