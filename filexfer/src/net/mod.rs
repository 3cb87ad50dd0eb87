//! Transport boundary: queries, responses, and dispatch.
//!
//! The engine talks to the wire only through the [`Transport`] trait. Request
//! and response variants abstract the handful of remote operations the
//! engine needs; their encoding is the transport's business.
//!
//! ```text
//! Loader ──► DelayDispatcher ──► NetDispatcher ──► Transport::submit
//!   ▲                                                   │
//!   └──────────── QueryCallback(QueryResult) ◄──────────┘
//! ```

mod delay;
mod dispatcher;
mod memory;

pub use delay::{DelayDispatcher, DelayDispatcherHandle};
pub use dispatcher::{Dispatch, NetDispatcher, QueryCallback};
pub use memory::MemoryTransport;

use crate::error::TransportError;
use crate::location::{DcId, FullRemoteLocation};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Outcome of one query.
pub type QueryResult = Result<Response, TransportError>;

/// Future returned by [`Transport::submit`].
pub type TransportFuture = Pin<Box<dyn Future<Output = QueryResult> + Send + 'static>>;

/// Moves requests to the remote side.
pub trait Transport: Send + Sync + 'static {
    /// Submits a query. Implementations should stop early once
    /// `query.cancel` fires, and report [`TransportError::Aborted`] when
    /// shutting down.
    fn submit(&self, query: Query) -> TransportFuture;
}

/// Traffic class of a query, used by transports to pick a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryClass {
    Download,
    DownloadSmall,
    Upload,
}

/// Server-provided SHA-256 over `[offset, offset + limit)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHash {
    pub offset: i64,
    pub limit: i64,
    pub hash: Vec<u8>,
}

/// Instruction to fetch a file from a content-delivery node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CdnRedirect {
    pub dc_id: DcId,
    pub file_token: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub file_hashes: Vec<FileHash>,
}

/// Remote operations the engine issues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Read `limit` bytes at `offset` from the file's home endpoint.
    GetFile {
        location: FullRemoteLocation,
        offset: i64,
        limit: i64,
        cdn_supported: bool,
    },
    /// Read from a CDN node after a redirect.
    GetCdnFile {
        file_token: Vec<u8>,
        offset: i64,
        limit: i64,
    },
    /// Ask the home endpoint to push a file part to the CDN again.
    ReuploadCdnFile {
        file_token: Vec<u8>,
        request_token: Vec<u8>,
    },
    /// Fetch hash ranges starting at `offset` for a CDN file.
    GetCdnFileHashes { file_token: Vec<u8>, offset: i64 },
    /// Store one part of a small file.
    SaveFilePart {
        file_id: i64,
        part: usize,
        bytes: Bytes,
    },
    /// Store one part of a big file; `total_parts` is unknown while the
    /// local file is still growing.
    SaveBigFilePart {
        file_id: i64,
        part: usize,
        total_parts: Option<usize>,
        bytes: Bytes,
    },
}

/// Successful replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    File(Bytes),
    CdnRedirect(CdnRedirect),
    CdnFile(Bytes),
    CdnReuploadNeeded { request_token: Vec<u8> },
    FileHashes(Vec<FileHash>),
    PartSaved(bool),
}

/// A request addressed to an endpoint, cancellable on its own.
#[derive(Debug)]
pub struct Query {
    pub id: u64,
    pub dc_id: DcId,
    pub class: QueryClass,
    pub request: Request,
    pub cancel: CancellationToken,
}

static QUERY_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Query {
    /// Creates a query with a fresh id and its own cancellation token.
    pub fn new(dc_id: DcId, class: QueryClass, request: Request) -> Self {
        Self {
            id: QUERY_COUNTER.fetch_add(1, Ordering::Relaxed),
            dc_id,
            class,
            request,
            cancel: CancellationToken::new(),
        }
    }
}
