//! File locations on both sides of a transfer.
//!
//! Each side is a closed enum: nothing known, a partial (resumable) record,
//! or the full final location. Partial records are what gets persisted so a
//! transfer can resume after a restart.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifier of a remote endpoint (data center, CDN node).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DcId(pub i32);

impl DcId {
    /// The endpoint uploads are sent to.
    pub const MAIN: DcId = DcId(0);
}

impl fmt::Display for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc{}", self.0)
    }
}

/// Kind of content being transferred.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    #[default]
    Document,
    Photo,
    Video,
    Audio,
    Animation,
    VoiceNote,
    Sticker,
    /// Content encrypted end-to-end; requires a secret key.
    Encrypted,
    Temp,
}

impl FileType {
    /// Subdirectory used for finished files of this type.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Document => "documents",
            Self::Photo => "photos",
            Self::Video => "videos",
            Self::Audio => "music",
            Self::Animation => "animations",
            Self::VoiceNote => "voice",
            Self::Sticker => "stickers",
            Self::Encrypted => "secret",
            Self::Temp => "temp",
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted)
    }
}

/// Key material for end-to-end encrypted files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEncryptionKey {
    #[default]
    None,
    /// Chained block cipher key and initial vector.
    Secret { key: Vec<u8>, iv: Vec<u8> },
}

impl FileEncryptionKey {
    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Secret { .. })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Secret { key, iv } => key.is_empty() || iv.is_empty(),
        }
    }
}

// =============================================================================
// Remote side
// =============================================================================

/// A file fully stored on the remote side.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FullRemoteLocation {
    pub file_type: FileType,
    pub dc_id: DcId,
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
}

/// An upload in progress: which parts the remote side already has.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRemoteLocation {
    pub file_id: i64,
    pub part_count: usize,
    pub part_size: i64,
    pub ready_part_count: usize,
    pub is_big: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteLocation {
    #[default]
    Empty,
    Partial(PartialRemoteLocation),
    Full(FullRemoteLocation),
}

// =============================================================================
// Local side
// =============================================================================

/// A download in progress: temp file plus readiness bitmask.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialLocalLocation {
    pub file_type: FileType,
    pub path: PathBuf,
    pub part_size: i64,
    /// Running iv of a chained-cipher download; empty otherwise.
    pub iv: Vec<u8>,
    /// Encoded [`Bitmask`](crate::bitmask::Bitmask) of ready parts.
    pub ready_bitmask: Vec<u8>,
    pub ready_size: i64,
}

/// A finished local file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullLocalLocation {
    pub file_type: FileType,
    pub path: PathBuf,
    pub mtime_nsec: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalLocation {
    #[default]
    Empty,
    Partial(PartialLocalLocation),
    Full(FullLocalLocation),
}

impl LocalLocation {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Empty => None,
            Self::Partial(partial) => Some(&partial.path),
            Self::Full(full) => Some(&full.path),
        }
    }
}
