//! filexfer - resumable chunked file transfer engine
//!
//! Moves files between local storage and a remote store in fixed-size parts.
//! Many transfers run at once under a shared bytes-in-flight budget, survive
//! restarts through persisted partial progress, and finish with verified,
//! published files.
//!
//! # Layers
//!
//! - [`parts`] decides which part to transfer next and tracks readiness.
//! - [`resource`] splits the in-flight budget between transfers.
//! - [`loader`] drives one transfer: start parts, apply results, finalize.
//! - [`net`] is the transport seam plus the dispatch and pacing helpers.
//! - [`transfer`] is the entry point: [`TransferManager`] owns everything.
//!
//! # Example
//!
//! ```no_run
//! use filexfer::{DownloadParams, TransferConfig, TransferContext, TransferManager};
//! # use filexfer::{FileType, FullLocalLocation, PartialRemoteLocation, QueryId, TransferCallback, TransferError};
//! # use filexfer::location::{DcId, FullRemoteLocation};
//! # use filexfer::net::MemoryTransport;
//! # use std::sync::Arc;
//! # struct Log;
//! # impl TransferCallback for Log {
//! #     fn on_download_ok(&self, _: QueryId, _: FullLocalLocation, _: i64, _: bool) {}
//! #     fn on_upload_ok(&self, _: QueryId, _: FileType, _: PartialRemoteLocation, _: i64) {}
//! #     fn on_error(&self, _: QueryId, _: TransferError) {}
//! # }
//! # async fn demo() {
//! let transport = Arc::new(MemoryTransport::new());
//! let ctx = TransferContext::new(TransferConfig::default(), transport);
//! let manager = TransferManager::start(ctx, Arc::new(Log));
//!
//! let remote = FullRemoteLocation {
//!     file_type: FileType::Document,
//!     dc_id: DcId(2),
//!     id: 42,
//!     access_hash: 7,
//!     file_reference: Vec::new(),
//! };
//! manager.download(1, DownloadParams::new(remote, 1 << 20).with_name("report.pdf"));
//! manager.close().await;
//! # }
//! ```

pub mod bitmask;
pub mod config;
pub mod crypto;
pub mod error;
pub mod loader;
pub mod location;
pub mod logging;
pub mod net;
pub mod ordered;
pub mod parts;
pub mod policy;
pub mod resource;
pub mod store;
pub mod transfer;

pub use bitmask::Bitmask;
pub use config::{ConfigError, TransferConfig};
pub use error::{TransferError, TransferResult, TransportError};
pub use loader::Progress;
pub use location::{
    FileEncryptionKey, FileType, FullLocalLocation, LocalLocation, PartialLocalLocation,
    PartialRemoteLocation, RemoteLocation,
};
pub use resource::ResourceMode;
pub use store::{FileProgressStore, MemoryProgressStore, ProgressStore};
pub use transfer::{
    DownloadParams, QueryId, TransferCallback, TransferContext, TransferManager, UploadParams,
};
