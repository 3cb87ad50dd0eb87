//! Upload half of the loader: read parts off the blocking pool, encrypt,
//! and send them as numbered file parts.

use super::file::{FileMode, LazyFile};
use super::{
    BlockingJob, FileInfo, LoaderBackend, PartApply, PartStart, PrefixInfo, Progress,
    UploadCallback,
};
use crate::bitmask::Bitmask;
use crate::config::TransferConfig;
use crate::crypto::{FileCipher, CIPHER_BLOCK_SIZE};
use crate::error::{TransferError, TransferResult, TransportError};
use crate::location::{
    DcId, FileEncryptionKey, FileType, LocalLocation, PartialRemoteLocation, RemoteLocation,
};
use crate::net::{Query, QueryClass, QueryResult, Request, Response};
use crate::parts::{Part, PartLimits, PartsManager, MAX_PART_SIZE};
use bytes::Bytes;
use std::fs;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to upload and where it may resume from.
#[derive(Clone, Debug)]
pub(crate) struct UploadRequest {
    pub file_type: FileType,
    pub local: LocalLocation,
    pub remote: RemoteLocation,
    pub expected_size: i64,
    pub encryption_key: FileEncryptionKey,
    /// Parts the remote side reported missing.
    pub bad_parts: Vec<usize>,
}

pub(crate) struct Uploader {
    request: UploadRequest,
    callback: Box<dyn UploadCallback>,
    config: Arc<TransferConfig>,
    cipher: Option<Arc<dyn FileCipher>>,

    file: Option<LazyFile>,

    file_id: i64,
    is_big: bool,
    part_size: i64,
    /// `iv_map[i]` is the chained iv that encrypts part `i`.
    iv_map: Vec<Vec<u8>>,
}

impl Uploader {
    pub(crate) fn new(
        request: UploadRequest,
        callback: Box<dyn UploadCallback>,
        config: Arc<TransferConfig>,
        cipher: Option<Arc<dyn FileCipher>>,
    ) -> Self {
        Self {
            request,
            callback,
            config,
            cipher,
            file: None,
            file_id: 0,
            is_big: false,
            part_size: 0,
            iv_map: Vec::new(),
        }
    }

    fn start_fresh(&mut self, expected_size: i64) {
        self.file_id = (rand::random::<i64>() & i64::MAX) | 1;
        self.is_big = expected_size > self.config.upload.big_file_threshold;
        self.part_size = 0;
    }

    fn update_local(&mut self, location: &LocalLocation) -> TransferResult<PrefixInfo> {
        let (path, prefix, is_ready) = match location {
            LocalLocation::Empty => {
                return Err(TransferError::InvalidLocation(
                    "upload needs a local file".into(),
                ))
            }
            LocalLocation::Partial(partial) => {
                let prefix = if partial.part_size > 0 {
                    Bitmask::decode(&partial.ready_bitmask).get_ready_prefix_size(
                        0,
                        partial.part_size,
                        0,
                    )
                } else {
                    partial.ready_size
                };
                (partial.path.clone(), prefix, false)
            }
            LocalLocation::Full(full) => (full.path.clone(), 0, true),
        };

        let file_size = fs::metadata(&path)
            .map_err(|e| TransferError::io(&path, e))?
            .len() as i64;
        let size = if is_ready {
            if file_size == 0 {
                return Err(TransferError::EmptyFile);
            }
            file_size
        } else {
            prefix.min(file_size)
        };

        if self.file.as_ref().map(LazyFile::path).as_ref() != Some(&path) {
            self.file = Some(LazyFile::new(path, FileMode::Read, self.config.fd_idle_timeout));
        }
        Ok(PrefixInfo { size, is_ready })
    }

    /// Replays the chained cipher over parts already on the remote side.
    fn generate_iv_map(&mut self, part_size: i64, count: usize) -> TransferResult<()> {
        let FileEncryptionKey::Secret { key, iv } = &self.request.encryption_key else {
            return Ok(());
        };
        let cipher = self
            .cipher
            .as_ref()
            .ok_or(TransferError::MissingEncryptionKey)?;
        let mut iv = iv.clone();
        self.iv_map = vec![iv.clone()];
        if count == 0 {
            return Ok(());
        }
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| TransferError::InvalidLocation("upload needs a local file".into()))?;
        for part in 0..count {
            let mut data = file
                .read_at(part as i64 * part_size, part_size as usize)
                .map_err(|e| TransferError::io(file.path(), e))?;
            pad_to_block(&mut data);
            cipher
                .encrypt_chained(key, &mut iv, &mut data)
                .map_err(|e| TransferError::Cipher(e.0))?;
            self.iv_map.push(iv.clone());
        }
        debug!(parts = count, "iv map rebuilt");
        Ok(())
    }

    fn partial_location(&self, part_count: usize, ready_part_count: usize) -> PartialRemoteLocation {
        PartialRemoteLocation {
            file_id: self.file_id,
            part_count,
            part_size: self.part_size,
            ready_part_count,
            is_big: self.is_big,
        }
    }
}

impl LoaderBackend for Uploader {
    type Published = ();

    fn kind(&self) -> &'static str {
        "upload"
    }

    fn init(&mut self, limits: PartLimits) -> TransferResult<FileInfo> {
        if matches!(self.request.remote, RemoteLocation::Full(_)) {
            return Err(TransferError::AlreadyComplete("uploaded"));
        }
        let is_secret = self.request.encryption_key.is_secret();
        if is_secret && (self.request.encryption_key.is_empty() || self.cipher.is_none()) {
            return Err(TransferError::MissingEncryptionKey);
        }

        let local = self.request.local.clone();
        let prefix = self.update_local(&local)?;
        let expected_size = self.request.expected_size.max(prefix.size);
        if expected_size > limits.max_file_size() {
            return Err(TransferError::TooBigFile {
                size: expected_size,
            });
        }

        let mut ready_count = 0;
        match self.request.remote.clone() {
            RemoteLocation::Partial(partial) if self.request.bad_parts.contains(&0) => {
                warn!(file_id = partial.file_id, "first part rejected, restarting upload");
                self.start_fresh(expected_size);
            }
            RemoteLocation::Partial(partial) => {
                if !is_valid_part_size(partial.part_size) {
                    return Err(TransferError::InvalidPartSize {
                        part_size: partial.part_size,
                    });
                }
                self.file_id = partial.file_id;
                self.is_big = partial.is_big;
                self.part_size = partial.part_size;
                ready_count = partial.ready_part_count;
                debug!(
                    file_id = self.file_id,
                    ready = ready_count,
                    bad = self.request.bad_parts.len(),
                    "resuming upload"
                );
            }
            _ => self.start_fresh(expected_size),
        }

        let ready_parts: Vec<usize> = (0..ready_count)
            .filter(|part| !self.request.bad_parts.contains(part))
            .collect();
        if is_secret {
            self.generate_iv_map(self.part_size, ready_count)?;
        }

        Ok(FileInfo {
            size: prefix.size,
            expected_size,
            is_size_final: prefix.is_ready,
            part_size: self.part_size,
            ready_parts,
            use_part_count_limit: true,
            is_upload: true,
            // Chained ivs exist only for parts dispatched in order.
            ordered_dispatch: is_secret || self.config.upload.ordered_dispatch,
            ..FileInfo::default()
        })
    }

    fn on_update_local_location(
        &mut self,
        location: &LocalLocation,
    ) -> TransferResult<Option<PrefixInfo>> {
        let prefix = self.update_local(location)?;
        if !self.is_big && prefix.size > self.config.upload.big_file_threshold {
            return Err(TransferError::UploadRestart);
        }
        Ok(Some(prefix))
    }

    fn start_part(&mut self, part: Part, parts: &PartsManager) -> TransferResult<PartStart> {
        self.part_size = parts.get_part_size();
        let file = self
            .file
            .clone()
            .ok_or_else(|| TransferError::InvalidLocation("upload needs a local file".into()))?;
        let Part { offset, size, .. } = part;
        Ok(PartStart::Prepare(Box::new(move || {
            let data = file
                .read_at(offset, size as usize)
                .map_err(|e| TransferError::io(file.path(), e))?;
            if (data.len() as i64) < size {
                return Err(TransferError::InconsistentSize(format!(
                    "read {} of {size} bytes at offset {offset}",
                    data.len()
                )));
            }
            Ok(data)
        })))
    }

    fn on_part_prepared(
        &mut self,
        part: Part,
        mut data: Vec<u8>,
        parts: &PartsManager,
    ) -> TransferResult<Query> {
        if let FileEncryptionKey::Secret { key, .. } = &self.request.encryption_key {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or(TransferError::MissingEncryptionKey)?;
            let mut iv = self.iv_map.get(part.id).cloned().ok_or_else(|| {
                TransferError::Internal(format!("no chained iv for part {}", part.id))
            })?;
            pad_to_block(&mut data);
            cipher
                .encrypt_chained(key, &mut iv, &mut data)
                .map_err(|e| TransferError::Cipher(e.0))?;
            if part.id + 1 == self.iv_map.len() {
                self.iv_map.push(iv);
            }
        }

        let bytes = Bytes::from(data);
        let request = if self.is_big {
            Request::SaveBigFilePart {
                file_id: self.file_id,
                part: part.id,
                total_parts: parts.is_size_known().then(|| parts.get_part_count()),
                bytes,
            }
        } else {
            Request::SaveFilePart {
                file_id: self.file_id,
                part: part.id,
                bytes,
            }
        };
        Ok(Query::new(DcId::MAIN, QueryClass::Upload, request))
    }

    fn process_part(
        &mut self,
        part: Part,
        result: QueryResult,
        _parts: &PartsManager,
    ) -> TransferResult<PartApply> {
        if let Err(TransportError::Rpc { message, .. }) = &result {
            if message == "FILE_UPLOAD_RESTART" {
                return Err(TransferError::UploadRestart);
            }
        }
        match result? {
            Response::PartSaved(true) => Ok(PartApply::Done(part.size)),
            Response::PartSaved(false) => Err(TransferError::Internal(format!(
                "remote side refused part {}",
                part.id
            ))),
            _ => Err(TransferError::Internal(
                "unexpected reply to file part".into(),
            )),
        }
    }

    fn on_progress(&mut self, progress: Progress) {
        self.callback.on_progress(&progress);
        self.part_size = progress.part_size;
        let partial = self.partial_location(progress.part_count, progress.ready_part_count);
        self.callback.on_partial_upload(partial, progress.ready_size);
    }

    fn publish(&mut self, _parts: &PartsManager) -> TransferResult<BlockingJob<()>> {
        let file = self.file.take();
        Ok(Box::new(move || {
            if let Some(file) = file {
                file.close();
            }
            Ok(())
        }))
    }

    fn on_ok(&mut self, _published: (), parts: &PartsManager) -> TransferResult<()> {
        let part_count = parts.get_part_count();
        let partial = self.partial_location(part_count, part_count);
        self.callback
            .on_ok(self.request.file_type, partial, parts.get_size_or_zero());
        Ok(())
    }

    fn on_error(&mut self, error: TransferError) {
        self.callback.on_error(error);
    }

    fn idle_deadline(&self) -> Option<tokio::time::Instant> {
        self.file.as_ref().and_then(LazyFile::idle_deadline)
    }

    fn release_idle_file(&mut self) {
        if let Some(file) = &self.file {
            file.release_if_idle();
        }
    }

    fn close(&mut self) {
        if let Some(file) = &self.file {
            file.close();
        }
    }
}

fn is_valid_part_size(part_size: i64) -> bool {
    part_size > 0 && part_size <= MAX_PART_SIZE && part_size % 1024 == 0
}

fn pad_to_block(data: &mut Vec<u8>) {
    let padded = data.len().div_ceil(CIPHER_BLOCK_SIZE) * CIPHER_BLOCK_SIZE;
    data.resize(padded, 0);
}
