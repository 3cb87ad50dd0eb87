//! Error types for the transfer engine.
//!
//! Two layers exist:
//!
//! - [`TransportError`]: what the transport collaborator reports for a single
//!   query. Transient kinds are retried per part by the loader.
//! - [`TransferError`]: the terminal outcome of a whole transfer, reported
//!   exactly once through `on_error`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Failure of a single query, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote side answered with an error code and message.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// The query was cancelled locally before it completed.
    #[error("query canceled")]
    Canceled,

    /// The transport is shutting down; the query will never complete.
    #[error("request aborted due to shutdown")]
    Aborted,

    /// Connection-level failure (reset, timeout, unreachable endpoint).
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Creates an RPC error.
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Returns true if retrying the same query may succeed.
    ///
    /// Flood waits, server-side failures and connection errors are transient.
    /// Shutdown aborts never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Rpc { code, .. } => *code == 420 || *code >= 500 || *code == -503,
            Self::Canceled | Self::Aborted => false,
        }
    }

    /// Returns the RPC message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Rpc { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Terminal failure of a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Cancelled by the caller.
    #[error("Canceled")]
    Canceled,

    /// The engine shut down before the transfer completed.
    #[error("Request aborted")]
    Aborted,

    /// A part kept failing with transient errors until the retry budget ran out.
    #[error("part {part} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        part: usize,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The transport reported an error that retrying cannot fix.
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),

    /// Downloaded content does not match the server-provided hash.
    #[error("Hash mismatch at offset {offset}")]
    HashMismatch { offset: i64 },

    /// A CDN redirect carried malformed encryption parameters.
    #[error("Invalid CDN {what}: expected {expected} bytes, got {actual}")]
    InvalidCdnKey {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// CDN token refreshes for one part exceeded the configured bound.
    #[error("CDN token refresh limit exceeded for part {part}")]
    CdnRefreshLimit { part: usize },

    /// Decryption or encryption of a part failed.
    #[error("Cipher failure: {0}")]
    Cipher(String),

    /// The file is larger than the part limits allow.
    #[error("Too big file: {size} bytes")]
    TooBigFile { size: i64 },

    /// Uploading a zero-length file.
    #[error("Can't upload empty file")]
    EmptyFile,

    /// The upload must be restarted with a different part layout.
    #[error("FILE_UPLOAD_RESTART")]
    UploadRestart,

    /// A resumed layout uses a part size the limits do not allow.
    #[error("Invalid part size {part_size}")]
    InvalidPartSize { part_size: i64 },

    /// The streaming limit was reached before the whole file was downloaded.
    #[error("FILE_DOWNLOAD_LIMIT")]
    DownloadLimit,

    /// The transfer was asked to finish before every part was ready.
    #[error("File transferring not finished")]
    NotFinished,

    /// A persisted ready part does not exist in the current layout.
    #[error("Invalid ready part {part}: file has {part_count} parts")]
    InvalidReadyPart { part: usize, part_count: usize },

    /// Received data contradicts what is known about the file size.
    #[error("Failed to transfer file: {0}")]
    InconsistentSize(String),

    /// An encrypted file type without a key, or a key without a cipher.
    #[error("Missing encryption key")]
    MissingEncryptionKey,

    /// The requested location combination cannot be transferred.
    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    /// Nothing to do: the file is already fully transferred.
    #[error("File is already {0}")]
    AlreadyComplete(&'static str),

    /// Local file I/O failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Unexpected response or broken internal expectation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for content integrity failures.
    ///
    /// These are never retried: they mean the remote object is corrupt or the
    /// key is wrong, and any persisted progress should be discarded.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. }
                | Self::InvalidCdnKey { .. }
                | Self::Cipher(_)
                | Self::InconsistentSize(_)
                | Self::InvalidReadyPart { .. }
        )
    }

    /// Returns true if starting the same transfer again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RetriesExhausted { .. } | Self::Aborted | Self::UploadRestart => true,
            Self::Transport(error) => error.is_transient(),
            Self::Io { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the transfer was stopped rather than failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::Aborted)
    }
}

impl From<TransportError> for TransferError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Canceled => Self::Canceled,
            TransportError::Aborted => Self::Aborted,
            other => Self::Transport(other),
        }
    }
}
