//! Integration tests for the transfer manager.
//!
//! These drive complete transfers through [`TransferManager`] against
//! in-process transports:
//! - out-of-order part completion and final progress
//! - cancellation and shutdown
//! - resuming from persisted progress
//! - CDN redirects with hash verification
//! - transient failure retries
//! - ordered upload dispatch and upload → download round trip
//! - secret files under a chained cipher, fresh and resumed
//! - streaming windows and uploads of growing files
//!
//! Run with: `cargo test --test transfer_integration`

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use filexfer::bitmask::Bitmask;
use filexfer::config::DelayConfig;
use filexfer::crypto::{cdn_part_iv, sha256, CipherError, FileCipher};
use filexfer::location::{DcId, FullRemoteLocation};
use filexfer::net::{
    CdnRedirect, FileHash, MemoryTransport, Query, QueryResult, Request, Response, Transport,
    TransportFuture,
};
use filexfer::policy::RetryPolicy;
use filexfer::{
    DownloadParams, FileEncryptionKey, FileType, FullLocalLocation, LocalLocation, MemoryProgressStore,
    PartialLocalLocation, PartialRemoteLocation, Progress, QueryId,
    TransferCallback, TransferConfig, TransferContext, TransferError, TransferManager,
    TransportError, UploadParams,
};

const PART: i64 = 64 << 10;
const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug)]
enum Event {
    Progress(QueryId, Progress),
    PartialDownload(QueryId, PartialLocalLocation),
    PartialUpload(QueryId, PartialRemoteLocation),
    DownloadOk(QueryId, FullLocalLocation, i64),
    UploadOk(QueryId, PartialRemoteLocation, i64),
    Error(QueryId, TransferError),
}

impl Event {
    fn query_id(&self) -> QueryId {
        match self {
            Event::Progress(id, _)
            | Event::PartialDownload(id, _)
            | Event::PartialUpload(id, _)
            | Event::DownloadOk(id, _, _)
            | Event::UploadOk(id, _, _)
            | Event::Error(id, _) => *id,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::DownloadOk(..) | Event::UploadOk(..) | Event::Error(..)
        )
    }
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl TransferCallback for Recorder {
    fn on_progress(&self, query_id: QueryId, progress: &Progress) {
        let _ = self.tx.send(Event::Progress(query_id, progress.clone()));
    }

    fn on_partial_download(
        &self,
        query_id: QueryId,
        partial: &PartialLocalLocation,
        _ready_size: i64,
        _size: i64,
    ) {
        let _ = self.tx.send(Event::PartialDownload(query_id, partial.clone()));
    }

    fn on_partial_upload(&self, query_id: QueryId, partial: &PartialRemoteLocation, _ready_size: i64) {
        let _ = self.tx.send(Event::PartialUpload(query_id, partial.clone()));
    }

    fn on_download_ok(&self, query_id: QueryId, location: FullLocalLocation, size: i64, _is_new: bool) {
        let _ = self.tx.send(Event::DownloadOk(query_id, location, size));
    }

    fn on_upload_ok(
        &self,
        query_id: QueryId,
        _file_type: FileType,
        partial: PartialRemoteLocation,
        size: i64,
    ) {
        let _ = self.tx.send(Event::UploadOk(query_id, partial, size));
    }

    fn on_error(&self, query_id: QueryId, error: TransferError) {
        let _ = self.tx.send(Event::Error(query_id, error));
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

/// Collects events of `query_id` until its terminal event.
async fn until_terminal(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    query_id: QueryId,
) -> (Vec<Event>, Event) {
    let mut seen = Vec::new();
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for transfer events")
            .expect("event channel closed");
        if event.query_id() != query_id {
            continue;
        }
        if event.is_terminal() {
            return (seen, event);
        }
        seen.push(event);
    }
}

/// Waits for a partial download report covering at least `ready_size` bytes.
async fn until_partial(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    query_id: QueryId,
    ready_size: i64,
) -> PartialLocalLocation {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for partial download")
            .expect("event channel closed");
        match event {
            Event::PartialDownload(id, partial) if id == query_id && partial.ready_size >= ready_size => {
                return partial;
            }
            event if event.query_id() == query_id && event.is_terminal() => {
                panic!("transfer ended early: {event:?}");
            }
            _ => {}
        }
    }
}

async fn until_partial_upload(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    query_id: QueryId,
    ready_part_count: usize,
) -> PartialRemoteLocation {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for partial upload")
            .expect("event channel closed");
        match event {
            Event::PartialUpload(id, partial)
                if id == query_id && partial.ready_part_count >= ready_part_count =>
            {
                return partial;
            }
            event if event.query_id() == query_id && event.is_terminal() => {
                panic!("transfer ended early: {event:?}");
            }
            _ => {}
        }
    }
}

fn sample(len: i64) -> Bytes {
    (0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>().into()
}

fn test_config(dir: &Path) -> TransferConfig {
    TransferConfig::default()
        .with_delay(DelayConfig::none())
        .with_temp_dir(dir.join("temp"))
        .with_files_dir(dir.join("files"))
}

fn expect_download(event: Event) -> (FullLocalLocation, i64) {
    match event {
        Event::DownloadOk(_, full, size) => (full, size),
        other => panic!("expected download to succeed, got {other:?}"),
    }
}

fn expect_upload(event: Event) -> (PartialRemoteLocation, i64) {
    match event {
        Event::UploadOk(_, partial, size) => (partial, size),
        other => panic!("expected upload to succeed, got {other:?}"),
    }
}

fn last_progress(events: &[Event]) -> Option<&Progress> {
    events.iter().rev().find_map(|event| match event {
        Event::Progress(_, progress) => Some(progress),
        _ => None,
    })
}

/// Holds every `GetFile` and small-file part until the test releases its
/// offset.
#[derive(Clone, Default)]
struct GatedTransport {
    inner: MemoryTransport,
    gates: Arc<Mutex<BTreeMap<i64, oneshot::Sender<()>>>>,
    /// `GetFile` offsets in submission order.
    requested: Arc<Mutex<Vec<i64>>>,
    submitted: Arc<AtomicUsize>,
}

impl GatedTransport {
    fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    async fn wait_for_gates(&self, count: usize) {
        timeout(WAIT, async {
            while self.gates.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("parts were never requested");
    }

    fn release(&self, offset: i64) {
        let gate = self.gates.lock().unwrap().remove(&offset);
        gate.expect("no pending request at offset").send(()).unwrap();
    }

    /// Opens every gate currently held.
    fn release_pending(&self) {
        let gates = std::mem::take(&mut *self.gates.lock().unwrap());
        for (_, gate) in gates {
            // Cancelled requests already dropped their receiver.
            let _ = gate.send(());
        }
    }

    fn requested(&self) -> Vec<i64> {
        self.requested.lock().unwrap().clone()
    }

    fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl Transport for GatedTransport {
    fn submit(&self, query: Query) -> TransportFuture {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        match &query.request {
            Request::GetFile { offset, .. } => {
                self.requested.lock().unwrap().push(*offset);
                self.gates.lock().unwrap().insert(*offset, tx);
            }
            Request::SaveFilePart { part, .. } => {
                self.gates.lock().unwrap().insert(*part as i64 * PART, tx);
            }
            _ => {}
        }
        let cancel = query.cancel.clone();
        let reply = self.inner.submit(query);
        Box::pin(async move {
            tokio::select! {
                _ = rx => reply.await,
                _ = cancel.cancelled() => Err(TransportError::Canceled),
            }
        })
    }
}

/// Fails `GetFile` at chosen offsets a fixed number of times.
#[derive(Clone, Default)]
struct FlakyTransport {
    inner: MemoryTransport,
    failures: Arc<Mutex<HashMap<i64, u32>>>,
    attempts: Arc<Mutex<HashMap<i64, u32>>>,
}

impl FlakyTransport {
    fn new(inner: MemoryTransport, offset: i64, failures: u32) -> Self {
        let transport = Self {
            inner,
            ..Self::default()
        };
        transport.failures.lock().unwrap().insert(offset, failures);
        transport
    }

    fn attempts_at(&self, offset: i64) -> u32 {
        self.attempts.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }
}

impl Transport for FlakyTransport {
    fn submit(&self, query: Query) -> TransportFuture {
        if let Request::GetFile { offset, .. } = &query.request {
            *self.attempts.lock().unwrap().entry(*offset).or_insert(0) += 1;
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(offset).filter(|left| **left > 0) {
                *left -= 1;
                return Box::pin(async { Err(TransportError::Network("connection reset".into())) });
            }
        }
        self.inner.submit(query)
    }
}

/// Keystream of key and iv bytes; symmetric like a real counter mode.
struct XorCipher;

impl FileCipher for XorCipher {
    fn ctr_apply(&self, key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CipherError> {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= key[i % key.len()] ^ iv[i % iv.len()];
        }
        Ok(())
    }

    fn encrypt_chained(&self, key: &[u8], iv: &mut Vec<u8>, data: &mut [u8]) -> Result<(), CipherError> {
        xor_chain(key, iv, data, true)
    }

    fn decrypt_chained(&self, key: &[u8], iv: &mut Vec<u8>, data: &mut [u8]) -> Result<(), CipherError> {
        xor_chain(key, iv, data, false)
    }
}

/// IGE-shaped toy chain: each block mixes in both iv halves, and the iv
/// becomes the last ciphertext block followed by the last plaintext block.
fn xor_chain(key: &[u8], iv: &mut Vec<u8>, data: &mut [u8], encrypt: bool) -> Result<(), CipherError> {
    if iv.len() != 32 || data.len() % 16 != 0 {
        return Err(CipherError(format!(
            "bad chained input: iv {} bytes, data {} bytes",
            iv.len(),
            data.len()
        )));
    }
    for block in data.chunks_mut(16) {
        let input = block.to_vec();
        for (i, byte) in block.iter_mut().enumerate() {
            *byte ^= key[i % key.len()] ^ iv[i] ^ iv[16 + i];
        }
        let (ciphertext, plaintext) = if encrypt {
            (block.to_vec(), input)
        } else {
            (input, block.to_vec())
        };
        iv.clear();
        iv.extend_from_slice(&ciphertext);
        iv.extend_from_slice(&plaintext);
    }
    Ok(())
}

fn secret_key() -> FileEncryptionKey {
    FileEncryptionKey::Secret {
        key: (0..32).map(|i| i as u8 ^ 0x3c).collect(),
        iv: vec![0x11; 32],
    }
}

/// Encrypts `data` in one pass under [`secret_key`].
fn encrypt_secret(data: &[u8]) -> Bytes {
    let FileEncryptionKey::Secret { key, iv } = secret_key() else {
        unreachable!()
    };
    let mut iv = iv;
    let mut out = data.to_vec();
    XorCipher.encrypt_chained(&key, &mut iv, &mut out).unwrap();
    out.into()
}

/// Redirects every download to a CDN node serving encrypted parts.
struct CdnTransport {
    data: Bytes,
    key: Vec<u8>,
    iv: [u8; 16],
    hashes: Vec<FileHash>,
    /// Hashes sent along with the redirect; the rest must be requested.
    redirect_hashes: usize,
    hash_requests: Arc<AtomicUsize>,
    /// Answers every CDN part request with an expired token.
    expire_tokens: bool,
}

impl CdnTransport {
    const HASH_RANGE: i64 = 128 << 10;

    fn new(data: Bytes) -> Self {
        let hashes = (0..data.len() as i64)
            .step_by(Self::HASH_RANGE as usize)
            .map(|offset| {
                let end = (offset + Self::HASH_RANGE).min(data.len() as i64);
                FileHash {
                    offset,
                    limit: Self::HASH_RANGE,
                    hash: sha256(&data[offset as usize..end as usize]).to_vec(),
                }
            })
            .collect();
        Self {
            data,
            key: (0..32).map(|i| i as u8 ^ 0x5a).collect(),
            iv: [7; 16],
            hashes,
            redirect_hashes: 2,
            hash_requests: Arc::new(AtomicUsize::new(0)),
            expire_tokens: false,
        }
    }

    fn serve(&self, request: Request) -> QueryResult {
        match request {
            Request::GetFile { .. } => Ok(Response::CdnRedirect(CdnRedirect {
                dc_id: DcId(101),
                file_token: b"token-1".to_vec(),
                encryption_key: self.key.clone(),
                encryption_iv: self.iv.to_vec(),
                file_hashes: self.hashes[..self.redirect_hashes].to_vec(),
            })),
            Request::GetCdnFile { .. } if self.expire_tokens => {
                Err(TransportError::rpc(400, "FILE_TOKEN_INVALID"))
            }
            Request::GetCdnFile { offset, limit, .. } => {
                let begin = (offset as usize).min(self.data.len());
                let end = (begin + limit as usize).min(self.data.len());
                let mut part = self.data[begin..end].to_vec();
                XorCipher
                    .ctr_apply(&self.key, &cdn_part_iv(&self.iv, offset), &mut part)
                    .map_err(|e| TransportError::rpc(500, e.0))?;
                Ok(Response::CdnFile(part.into()))
            }
            Request::GetCdnFileHashes { offset, .. } => {
                self.hash_requests.fetch_add(1, Ordering::SeqCst);
                Ok(Response::FileHashes(
                    self.hashes
                        .iter()
                        .filter(|hash| hash.offset >= offset)
                        .cloned()
                        .collect(),
                ))
            }
            _ => Err(TransportError::rpc(400, "METHOD_NOT_SUPPORTED")),
        }
    }
}

impl Transport for CdnTransport {
    fn submit(&self, query: Query) -> TransportFuture {
        let result = self.serve(query.request);
        Box::pin(async move { result })
    }
}

fn cdn_location() -> FullRemoteLocation {
    FullRemoteLocation {
        file_type: FileType::Video,
        dc_id: DcId(4),
        id: 77,
        access_hash: 1,
        file_reference: Vec::new(),
    }
}

/// Records the order in which upload parts reach the transport.
#[derive(Clone, Default)]
struct RecordingTransport {
    inner: MemoryTransport,
    parts: Arc<Mutex<Vec<usize>>>,
}

impl Transport for RecordingTransport {
    fn submit(&self, query: Query) -> TransportFuture {
        if let Request::SaveFilePart { part, .. } | Request::SaveBigFilePart { part, .. } =
            &query.request
        {
            self.parts.lock().unwrap().push(*part);
        }
        self.inner.submit(query)
    }
}

// ============================================================================
// Downloads
// ============================================================================

/// Parts completing in reverse order still produce a complete file and a
/// final progress report with every part ready.
#[tokio::test]
async fn test_download_with_parts_completing_in_reverse() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Document, data.clone());
    let transport = GatedTransport::new(memory);

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport.clone()));
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(location, data.len() as i64).with_name("report.bin"));

    transport.wait_for_gates(10).await;
    for part in (0..10).rev() {
        transport.release(part * PART);
    }

    let (events, terminal) = until_terminal(&mut rx, 1).await;
    let (full, size) = expect_download(terminal);
    assert_eq!(size, data.len() as i64);
    assert_eq!(full.path.file_name().unwrap(), "report.bin");
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());

    let progress = last_progress(&events).expect("no progress reported");
    assert!(progress.is_ready);
    assert_eq!(progress.part_count, 10);
    assert_eq!(progress.ready_part_count, 10);
    assert_eq!(Bitmask::decode(&progress.ready_bitmask).ready_count(), 10);

    manager.close().await;
}

/// Cancelling reports `Canceled` exactly once and stops all traffic.
#[tokio::test]
async fn test_cancel_stops_requests() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Document, data.clone());
    let transport = GatedTransport::new(memory);

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport.clone()));
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(location, data.len() as i64));

    transport.wait_for_gates(10).await;
    for part in 0..3 {
        transport.release(part * PART);
    }
    until_partial(&mut rx, 1, 3 * PART).await;

    manager.cancel(1);
    let (_, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(terminal, Event::Error(1, TransferError::Canceled)));

    let submitted = transport.submitted();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.submitted(), submitted);

    manager.close().await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !event.is_terminal(),
            "unexpected event after cancel: {event:?}"
        );
    }
}

/// A download interrupted by shutdown resumes from the progress store and
/// only requests the missing parts.
#[tokio::test]
async fn test_download_resumes_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Document, data.clone());
    let store = Arc::new(MemoryProgressStore::new());

    // First run: five parts arrive, then the engine shuts down.
    let gated = GatedTransport::new(memory.clone());
    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(gated.clone()))
        .with_store(store.clone());
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(location.clone(), data.len() as i64));

    gated.wait_for_gates(10).await;
    for part in 0..5 {
        gated.release(part * PART);
    }
    until_partial(&mut rx, 1, 5 * PART).await;
    manager.close().await;

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(terminal, Event::Error(1, TransferError::Aborted)));
    assert_eq!(store.len(), 1);

    // Second run picks up the stored partial location.
    let memory_before = memory.request_count();
    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(memory.clone()))
        .with_store(store.clone());
    let manager = TransferManager::start(ctx, callback);
    manager.download(2, DownloadParams::new(location, data.len() as i64));

    let (_, terminal) = until_terminal(&mut rx, 2).await;
    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());
    assert_eq!(memory.request_count() - memory_before, 5);
    assert!(store.is_empty());

    manager.close().await;
}

/// Closing the manager aborts every live transfer.
#[tokio::test]
async fn test_close_aborts_live_transfers() {
    let dir = tempfile::tempdir().unwrap();
    let memory = MemoryTransport::new();
    let first = memory.publish(FileType::Document, sample(4 * PART));
    let second = memory.publish(FileType::Photo, sample(3 * PART));
    let transport = GatedTransport::new(memory);

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport.clone()));
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(first, 4 * PART));
    manager.download(2, DownloadParams::new(second, 3 * PART));
    transport.wait_for_gates(7).await;

    manager.close().await;

    let mut aborted = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::Error(id, TransferError::Aborted) = event {
            aborted.push(id);
        }
    }
    aborted.sort_unstable();
    assert_eq!(aborted, vec![1, 2]);
}

#[tokio::test]
async fn test_duplicate_query_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Document, sample(2 * PART));
    let transport = GatedTransport::new(memory);

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport.clone()));
    let manager = TransferManager::start(ctx, callback);
    manager.download(5, DownloadParams::new(location.clone(), 2 * PART));
    manager.download(5, DownloadParams::new(location, 2 * PART));

    let (_, terminal) = until_terminal(&mut rx, 5).await;
    assert!(matches!(terminal, Event::Error(5, TransferError::Internal(_))));

    // The original transfer is unaffected.
    transport.wait_for_gates(2).await;
    transport.release(0);
    transport.release(PART);
    let (_, terminal) = until_terminal(&mut rx, 5).await;
    assert!(matches!(terminal, Event::DownloadOk(5, ..)));

    manager.close().await;
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(2 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Document, data.clone());
    let transport = FlakyTransport::new(memory, 0, 2);

    let (callback, mut rx) = recorder();
    let config =
        test_config(dir.path()).with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)));
    let ctx = TransferContext::new(config, Arc::new(transport.clone()));
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(location, data.len() as i64));

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());
    assert_eq!(transport.attempts_at(0), 3);

    manager.close().await;
}

#[tokio::test]
async fn test_retry_budget_exhaustion_fails_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Document, sample(2 * PART));
    let transport = FlakyTransport::new(memory, 0, u32::MAX);

    let (callback, mut rx) = recorder();
    let config =
        test_config(dir.path()).with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)));
    let ctx = TransferContext::new(config, Arc::new(transport.clone()));
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(location, 2 * PART));

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    match terminal {
        Event::Error(
            1,
            TransferError::RetriesExhausted {
                part: 0,
                attempts: 3,
                source: TransportError::Network(_),
            },
        ) => {}
        other => panic!("expected retries to be exhausted, got {other:?}"),
    }
    assert_eq!(transport.attempts_at(0), 3);

    manager.close().await;
}

// ============================================================================
// CDN
// ============================================================================

/// A redirected download decrypts CDN parts and verifies every hash range,
/// fetching the ranges the redirect did not carry.
#[tokio::test]
async fn test_cdn_download_is_decrypted_and_verified() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let transport = Arc::new(CdnTransport::new(data.clone()));
    let hash_requests = Arc::clone(&transport.hash_requests);

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), transport).with_cipher(Arc::new(XorCipher));
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(cdn_location(), data.len() as i64));

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());
    assert!(hash_requests.load(Ordering::SeqCst) >= 1);

    manager.close().await;
}

#[tokio::test]
async fn test_cdn_hash_mismatch_fails_and_forgets_progress() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(4 * PART);
    let mut transport = CdnTransport::new(data.clone());
    transport.hashes[1].hash[0] ^= 0xff;
    let store = Arc::new(MemoryProgressStore::new());

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport))
        .with_cipher(Arc::new(XorCipher))
        .with_store(store.clone());
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(cdn_location(), data.len() as i64));

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    match terminal {
        Event::Error(1, TransferError::HashMismatch { offset }) => {
            assert_eq!(offset, CdnTransport::HASH_RANGE);
        }
        other => panic!("expected hash mismatch, got {other:?}"),
    }
    assert!(store.is_empty());

    manager.close().await;
}

#[tokio::test]
async fn test_cdn_redirect_without_cipher_fails() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(CdnTransport::new(sample(2 * PART)));

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), transport);
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(cdn_location(), 2 * PART));

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(terminal, Event::Error(1, TransferError::Cipher(_))));

    manager.close().await;
}

// ============================================================================
// Uploads
// ============================================================================

/// With ordered dispatch, parts reach the transport in part order, and the
/// uploaded file downloads back byte for byte.
#[tokio::test]
async fn test_ordered_upload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(5 * PART + 100);
    let source = dir.path().join("source.bin");
    std::fs::write(&source, &data).unwrap();

    let transport = RecordingTransport::default();
    let store = Arc::new(MemoryProgressStore::new());
    let (callback, mut rx) = recorder();
    let config = test_config(dir.path()).with_ordered_upload_dispatch(true);
    let ctx = TransferContext::new(config, Arc::new(transport.clone())).with_store(store.clone());
    let manager = TransferManager::start(ctx, callback);

    let local = LocalLocation::Full(FullLocalLocation {
        file_type: FileType::Document,
        path: source,
        mtime_nsec: 0,
    });
    manager.upload(1, UploadParams::new(FileType::Document, local));

    let (events, terminal) = until_terminal(&mut rx, 1).await;
    let (partial, size) = expect_upload(terminal);
    assert_eq!(size, data.len() as i64);
    assert_eq!(partial.part_count, 6);
    assert_eq!(partial.ready_part_count, 6);
    assert!(!partial.is_big);
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::PartialUpload(1, _))));
    assert!(store.is_empty());

    let order = transport.parts.lock().unwrap().clone();
    assert_eq!(order, (0..6).collect::<Vec<_>>());

    let location = transport
        .inner
        .finish_upload(FileType::Document, &partial, size)
        .expect("all parts stored");
    manager.download(2, DownloadParams::new(location, size).with_name("copy.bin"));
    let (_, terminal) = until_terminal(&mut rx, 2).await;
    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());

    manager.close().await;
}

/// Cancelling an upload after three of ten parts were stored reports
/// `Canceled` once and sends nothing further.
#[tokio::test]
async fn test_cancel_upload_after_three_parts() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let source = dir.path().join("source.bin");
    std::fs::write(&source, &data).unwrap();

    let transport = GatedTransport::new(MemoryTransport::new());
    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport.clone()));
    let manager = TransferManager::start(ctx, callback);
    let local = LocalLocation::Full(FullLocalLocation {
        file_type: FileType::Document,
        path: source,
        mtime_nsec: 0,
    });
    manager.upload(1, UploadParams::new(FileType::Document, local));

    transport.wait_for_gates(10).await;
    for part in 0..3 {
        transport.release(part * PART);
    }
    let partial = until_partial_upload(&mut rx, 1, 3).await;
    assert_eq!(partial.part_count, 10);

    manager.cancel(1);
    let (_, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(terminal, Event::Error(1, TransferError::Canceled)));

    let submitted = transport.submitted();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.submitted(), submitted);

    manager.close().await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !event.is_terminal(),
            "unexpected event after cancel: {event:?}"
        );
    }
}

#[tokio::test]
async fn test_upload_of_empty_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("empty.bin");
    std::fs::write(&source, b"").unwrap();

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(MemoryTransport::new()));
    let manager = TransferManager::start(ctx, callback);
    let local = LocalLocation::Full(FullLocalLocation {
        file_type: FileType::Document,
        path: source,
        mtime_nsec: 0,
    });
    manager.upload(1, UploadParams::new(FileType::Document, local));

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(terminal, Event::Error(1, TransferError::EmptyFile)));

    manager.close().await;
}

// ============================================================================
// Secret files
// ============================================================================

/// Parts of a secret file arrive out of order but are decrypted strictly in
/// part order, so the chained cipher yields the original bytes.
#[tokio::test]
async fn test_secret_download_decrypts_in_part_order() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Encrypted, encrypt_secret(&data));
    let transport = GatedTransport::new(memory);

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport.clone()))
        .with_cipher(Arc::new(XorCipher));
    let manager = TransferManager::start(ctx, callback);
    manager.download(
        1,
        DownloadParams::new(location, data.len() as i64).with_encryption_key(secret_key()),
    );

    transport.wait_for_gates(10).await;
    for part in (0..10).rev() {
        transport.release(part * PART);
    }

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    let (full, size) = expect_download(terminal);
    assert_eq!(size, data.len() as i64);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());

    manager.close().await;
}

/// A window cannot be honoured for a chained cipher; the whole file is
/// downloaded instead of stalling at the first window part.
#[tokio::test]
async fn test_secret_download_ignores_streaming_window() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Encrypted, encrypt_secret(&data));

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(memory.clone()))
        .with_cipher(Arc::new(XorCipher));
    let manager = TransferManager::start(ctx, callback);
    manager.download(
        1,
        DownloadParams::new(location, data.len() as i64)
            .with_encryption_key(secret_key())
            .with_range(4 * PART, 2 * PART),
    );
    manager.update_downloaded_part(1, 6 * PART, PART);

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());
    assert_eq!(memory.request_count(), 10);

    manager.close().await;
}

/// Only the decrypted prefix survives an interrupted secret download, along
/// with the full chained iv; the resumed run fetches the rest and continues
/// the chain from that iv.
#[tokio::test]
async fn test_secret_download_resumes_decrypted_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Encrypted, encrypt_secret(&data));
    let gated = GatedTransport::new(memory.clone());
    let store = Arc::new(MemoryProgressStore::new());

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(gated.clone()))
        .with_cipher(Arc::new(XorCipher))
        .with_store(store.clone());
    let manager = TransferManager::start(ctx, callback);
    let params = DownloadParams::new(location, data.len() as i64).with_encryption_key(secret_key());
    manager.download(1, params.clone());

    gated.wait_for_gates(10).await;
    // Part 5 lands but stays encrypted behind the gap at 3 and 4.
    for part in [0, 1, 2, 5] {
        gated.release(part * PART);
    }
    let partial = until_partial(&mut rx, 1, 3 * PART).await;
    assert_eq!(partial.ready_size, 3 * PART);
    assert_eq!(partial.iv.len(), XorCipher.chained_iv_len());
    assert_eq!(Bitmask::decode(&partial.ready_bitmask).as_vector(), vec![0, 1, 2]);
    manager.close().await;

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(terminal, Event::Error(1, TransferError::Aborted)));
    assert_eq!(store.len(), 1);

    let memory_before = memory.request_count();
    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(memory.clone()))
        .with_cipher(Arc::new(XorCipher))
        .with_store(store.clone());
    let manager = TransferManager::start(ctx, callback);
    manager.download(2, params);

    let (_, terminal) = until_terminal(&mut rx, 2).await;
    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());
    assert_eq!(memory.request_count() - memory_before, 7);

    manager.close().await;
}

/// A resumed secret upload rebuilds the chained ivs of the parts already
/// stored, so the remote bytes match a single uninterrupted encryption.
#[tokio::test]
async fn test_secret_upload_resumes_with_rebuilt_ivs() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(6 * PART);
    let source = dir.path().join("secret.bin");
    std::fs::write(&source, &data).unwrap();
    let local = LocalLocation::Full(FullLocalLocation {
        file_type: FileType::Encrypted,
        path: source,
        mtime_nsec: 0,
    });
    let params = UploadParams::new(FileType::Encrypted, local).with_encryption_key(secret_key());

    let memory = MemoryTransport::new();
    let gated = GatedTransport::new(memory.clone());
    let store = Arc::new(MemoryProgressStore::new());
    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(gated.clone()))
        .with_cipher(Arc::new(XorCipher))
        .with_store(store.clone());
    let manager = TransferManager::start(ctx, callback);
    manager.upload(1, params.clone());

    gated.wait_for_gates(6).await;
    for part in 0..3 {
        gated.release(part * PART);
    }
    until_partial_upload(&mut rx, 1, 3).await;
    manager.close().await;
    let (_, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(terminal, Event::Error(1, TransferError::Aborted)));
    assert_eq!(store.len(), 1);

    let transport = RecordingTransport {
        inner: memory.clone(),
        ..RecordingTransport::default()
    };
    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport.clone()))
        .with_cipher(Arc::new(XorCipher))
        .with_store(store.clone());
    let manager = TransferManager::start(ctx, callback);
    manager.upload(2, params);

    let (_, terminal) = until_terminal(&mut rx, 2).await;
    let (partial, size) = expect_upload(terminal);
    assert_eq!(size, data.len() as i64);
    assert_eq!(partial.part_count, 6);
    assert_eq!(transport.parts.lock().unwrap().clone(), vec![3, 4, 5]);
    assert!(store.is_empty());

    // Publish the raw ciphertext so it can be compared without decrypting.
    let location = memory
        .finish_upload(FileType::Document, &partial, size)
        .expect("all parts stored");
    manager.download(3, DownloadParams::new(location, size).with_name("cipher.bin"));
    let (_, terminal) = until_terminal(&mut rx, 3).await;
    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), encrypt_secret(&data).to_vec());

    manager.close().await;
}

// ============================================================================
// Windows and growing files
// ============================================================================

/// A download limited to a window stops once the window is ready.
#[tokio::test]
async fn test_streaming_window_stops_at_limit() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Video, data.clone());

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(memory.clone()));
    let manager = TransferManager::start(ctx, callback);
    manager.download(
        1,
        DownloadParams::new(location, data.len() as i64).with_range(4 * PART, 2 * PART),
    );

    let (events, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(terminal, Event::Error(1, TransferError::DownloadLimit)));
    assert_eq!(memory.request_count(), 2);

    let partial = events
        .iter()
        .rev()
        .find_map(|event| match event {
            Event::PartialDownload(_, partial) => Some(partial),
            _ => None,
        })
        .expect("no partial download reported");
    assert_eq!(Bitmask::decode(&partial.ready_bitmask).as_vector(), vec![4, 5]);
    assert_eq!(partial.ready_size, 2 * PART);

    manager.close().await;
}

/// Moving the window cancels parts outside it and fetches from the new
/// offset first; an unlimited window then completes the file.
#[tokio::test]
async fn test_update_downloaded_part_moves_window() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(10 * PART);
    let memory = MemoryTransport::new();
    let location = memory.publish(FileType::Video, data.clone());
    let transport = GatedTransport::new(memory);

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport.clone()));
    let manager = TransferManager::start(ctx, callback);
    manager.download(
        1,
        DownloadParams::new(location, data.len() as i64).with_range(0, 2 * PART),
    );

    transport.wait_for_gates(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.requested(), vec![0, PART]);

    manager.update_downloaded_part(1, 6 * PART, 0);

    let terminal = timeout(WAIT, async {
        loop {
            transport.release_pending();
            if let Ok(Some(event)) = timeout(Duration::from_millis(20), rx.recv()).await {
                if event.query_id() == 1 && event.is_terminal() {
                    return event;
                }
            }
        }
    })
    .await
    .expect("download never finished");

    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());
    assert_eq!(transport.requested()[2], 6 * PART);

    manager.close().await;
}

/// An upload of a file still being written sends only its known prefix, then
/// finishes once the final location arrives.
#[tokio::test]
async fn test_upload_follows_growing_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample(5 * PART);
    let source = dir.path().join("growing.bin");
    std::fs::write(&source, &data[..2 * PART as usize]).unwrap();

    let memory = MemoryTransport::new();
    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(memory.clone()));
    let manager = TransferManager::start(ctx, callback);
    let local = LocalLocation::Partial(PartialLocalLocation {
        file_type: FileType::Video,
        path: source.clone(),
        part_size: 0,
        iv: Vec::new(),
        ready_bitmask: Vec::new(),
        ready_size: 2 * PART,
    });
    manager.upload(
        1,
        UploadParams::new(FileType::Video, local).with_expected_size(data.len() as i64),
    );

    // Files of unknown size start with 32 KiB parts.
    let partial = until_partial_upload(&mut rx, 1, 4).await;
    assert_eq!(partial.part_size, 32 << 10);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(memory.request_count(), 4);

    std::fs::write(&source, &data).unwrap();
    manager.update_local_file_location(
        1,
        LocalLocation::Full(FullLocalLocation {
            file_type: FileType::Video,
            path: source,
            mtime_nsec: 0,
        }),
    );

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    let (partial, size) = expect_upload(terminal);
    assert_eq!(size, data.len() as i64);
    assert_eq!(partial.part_count, 10);

    let location = memory
        .finish_upload(FileType::Video, &partial, size)
        .expect("all parts stored");
    manager.download(2, DownloadParams::new(location, size).with_name("grown.bin"));
    let (_, terminal) = until_terminal(&mut rx, 2).await;
    let (full, _) = expect_download(terminal);
    assert_eq!(std::fs::read(&full.path).unwrap(), data.to_vec());

    manager.close().await;
}

/// A CDN that keeps rejecting its token fails the part once the refresh
/// allowance is spent.
#[tokio::test]
async fn test_cdn_token_refresh_limit_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = CdnTransport::new(sample(2 * PART));
    transport.expire_tokens = true;

    let (callback, mut rx) = recorder();
    let ctx = TransferContext::new(test_config(dir.path()), Arc::new(transport))
        .with_cipher(Arc::new(XorCipher));
    let manager = TransferManager::start(ctx, callback);
    manager.download(1, DownloadParams::new(cdn_location(), 2 * PART));

    let (_, terminal) = until_terminal(&mut rx, 1).await;
    assert!(matches!(
        terminal,
        Event::Error(1, TransferError::CdnRefreshLimit { .. })
    ));

    manager.close().await;
}
