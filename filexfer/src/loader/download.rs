//! Download half of the loader: fetch parts, decrypt, verify, publish.
//!
//! A download starts at the file's home endpoint. The home endpoint may
//! redirect to a CDN node, after which parts are fetched from the node,
//! decrypted with a counter-mode key, and verified against server-provided
//! hash ranges before the transfer may finish. Expired CDN tokens fall back
//! to the home endpoint, bounded per part by `cdn_token_refresh_limit`.

use super::file::{unique_path, FileMode, LazyFile};
use super::{
    BlockingJob, CheckInfo, DownloadCallback, FileInfo, LoaderBackend, PartApply, PartStart,
    Progress,
};
use crate::bitmask::Bitmask;
use crate::config::TransferConfig;
use crate::crypto::{cdn_part_iv, sha256, FileCipher, CIPHER_BLOCK_SIZE};
use crate::error::{TransferError, TransferResult, TransportError};
use crate::location::{
    DcId, FileEncryptionKey, FullLocalLocation, FullRemoteLocation, LocalLocation,
    PartialLocalLocation,
};
use crate::net::{CdnRedirect, FileHash, Query, QueryClass, QueryResult, Request, Response};
use crate::parts::{Part, PartLimits, PartsManager};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, trace, warn};

/// Largest part size accepted from a resumed partial location.
const MAX_RESUME_PART_SIZE: i64 = 1 << 20;

const CDN_KEY_SIZE: usize = 32;
const CDN_IV_SIZE: usize = 16;

const TEMP_NAME_ATTEMPTS: usize = 16;

/// What to download and where it may resume from.
#[derive(Clone, Debug)]
pub(crate) struct DownloadRequest {
    pub remote: FullRemoteLocation,
    pub local: LocalLocation,
    /// 0 if unknown.
    pub size: i64,
    /// Suggested name of the published file.
    pub name: String,
    pub encryption_key: FileEncryptionKey,
    pub is_small: bool,
    pub offset: i64,
    pub limit: i64,
}

struct CdnSession {
    dc_id: DcId,
    file_token: Vec<u8>,
    key: Vec<u8>,
    iv: [u8; 16],
}

pub(crate) struct Downloader {
    request: DownloadRequest,
    callback: Box<dyn DownloadCallback>,
    config: Arc<TransferConfig>,
    cipher: Option<Arc<dyn FileCipher>>,

    file: Option<LazyFile>,
    /// Running iv of a chained-cipher download.
    iv: Vec<u8>,
    /// iv after each decrypted part not yet in the ready prefix.
    part_ivs: BTreeMap<usize, Vec<u8>>,
    /// iv continuing the ready prefix.
    ready_iv: Vec<u8>,

    cdn: Option<CdnSession>,
    cdn_generation: u64,
    part_generation: HashMap<usize, u64>,
    reupload_tokens: HashMap<usize, Vec<u8>>,
    refreshes: HashMap<usize, u32>,

    hashes: BTreeMap<i64, FileHash>,
    need_check: bool,
    hash_query_pending: bool,
}

impl Downloader {
    pub(crate) fn new(
        request: DownloadRequest,
        callback: Box<dyn DownloadCallback>,
        config: Arc<TransferConfig>,
        cipher: Option<Arc<dyn FileCipher>>,
    ) -> Self {
        Self {
            request,
            callback,
            config,
            cipher,
            file: None,
            iv: Vec::new(),
            part_ivs: BTreeMap::new(),
            ready_iv: Vec::new(),
            cdn: None,
            cdn_generation: 0,
            part_generation: HashMap::new(),
            reupload_tokens: HashMap::new(),
            refreshes: HashMap::new(),
            hashes: BTreeMap::new(),
            need_check: false,
            hash_query_pending: false,
        }
    }

    fn query_class(&self) -> QueryClass {
        if self.request.is_small {
            QueryClass::DownloadSmall
        } else {
            QueryClass::Download
        }
    }

    fn secret_key(&self) -> Option<(&[u8], &[u8])> {
        match &self.request.encryption_key {
            FileEncryptionKey::Secret { key, iv } => Some((key, iv)),
            FileEncryptionKey::None => None,
        }
    }

    /// Validates a partial location, returning its part size and ready parts.
    fn resume(&mut self, partial: &PartialLocalLocation) -> Option<(i64, Vec<usize>)> {
        if !is_valid_part_size(partial.part_size) {
            warn!(part_size = partial.part_size, "ignoring partial download with bad part size");
            return None;
        }
        if !partial.path.is_file() {
            warn!(path = %partial.path.display(), "ignoring partial download with missing file");
            return None;
        }

        let mut ready_parts = Bitmask::decode(&partial.ready_bitmask).as_vector();
        if self.request.size > 0 {
            let part_count = (self.request.size + partial.part_size - 1) / partial.part_size;
            if ready_parts.iter().any(|&part| part as i64 >= part_count) {
                warn!(part_count, "partial bitmask exceeds file size; downloading from scratch");
                ready_parts.clear();
            }
        }
        if self.request.encryption_key.is_secret() {
            // The stored iv continues the contiguous prefix only.
            let prefix = ready_parts
                .iter()
                .enumerate()
                .take_while(|(i, part)| i == *part)
                .count();
            ready_parts.truncate(prefix);
            let iv_len = self.cipher.as_ref().map(|cipher| cipher.chained_iv_len());
            if prefix > 0 && Some(partial.iv.len()) == iv_len {
                self.iv = partial.iv.clone();
            } else {
                ready_parts.clear();
            }
        }

        self.file = Some(LazyFile::new(
            partial.path.clone(),
            FileMode::Write,
            self.config.fd_idle_timeout,
        ));
        debug!(
            path = %partial.path.display(),
            part_size = partial.part_size,
            ready = ready_parts.len(),
            "resuming download"
        );
        Some((partial.part_size, ready_parts))
    }

    fn ensure_file(&mut self) -> TransferResult<LazyFile> {
        if let Some(file) = &self.file {
            return Ok(file.clone());
        }
        let dir = self.config.temp_dir.join(self.request.remote.file_type.dir_name());
        fs::create_dir_all(&dir).map_err(|e| TransferError::io(&dir, e))?;
        for _ in 0..TEMP_NAME_ATTEMPTS {
            let name = format!(
                "{:x}_{:08x}.part",
                self.request.remote.id as u64,
                rand::random::<u32>()
            );
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), "temp file created");
                    let file = LazyFile::new(path, FileMode::Write, self.config.fd_idle_timeout);
                    self.file = Some(file.clone());
                    return Ok(file);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(TransferError::io(path, e)),
            }
        }
        Err(TransferError::Internal(format!(
            "no free temp file name in {}",
            dir.display()
        )))
    }

    fn count_refresh(&mut self, part: Part) -> TransferResult<()> {
        let count = self.refreshes.entry(part.id).or_insert(0);
        *count += 1;
        if *count > self.config.cdn_token_refresh_limit {
            return Err(TransferError::CdnRefreshLimit { part: part.id });
        }
        Ok(())
    }

    fn on_cdn_redirect(&mut self, redirect: &CdnRedirect) -> TransferResult<()> {
        if let Some(cdn) = &self.cdn {
            if cdn.file_token == redirect.file_token {
                return Ok(());
            }
        }
        if redirect.encryption_key.len() != CDN_KEY_SIZE {
            return Err(TransferError::InvalidCdnKey {
                what: "key",
                expected: CDN_KEY_SIZE,
                actual: redirect.encryption_key.len(),
            });
        }
        let iv: [u8; 16] = redirect.encryption_iv.as_slice().try_into().map_err(|_| {
            TransferError::InvalidCdnKey {
                what: "iv",
                expected: CDN_IV_SIZE,
                actual: redirect.encryption_iv.len(),
            }
        })?;
        if self.cipher.is_none() {
            return Err(TransferError::Cipher("CDN download requires a cipher".into()));
        }

        debug!(dc = %redirect.dc_id, hashes = redirect.file_hashes.len(), "redirected to CDN");
        self.cdn = Some(CdnSession {
            dc_id: redirect.dc_id,
            file_token: redirect.file_token.clone(),
            key: redirect.encryption_key.clone(),
            iv,
        });
        self.cdn_generation += 1;
        self.need_check = true;
        self.add_hashes(&redirect.file_hashes);
        Ok(())
    }

    fn add_hashes(&mut self, hashes: &[FileHash]) {
        for hash in hashes {
            self.hashes.insert(hash.offset, hash.clone());
        }
    }

    fn file_name(&self) -> String {
        sanitize_file_name(&self.request.name).unwrap_or_else(|| {
            format!(
                "{}_{}",
                self.request.remote.file_type.dir_name(),
                self.request.remote.id
            )
        })
    }
}

impl LoaderBackend for Downloader {
    type Published = FullLocalLocation;

    fn kind(&self) -> &'static str {
        "download"
    }

    fn init(&mut self, limits: PartLimits) -> TransferResult<FileInfo> {
        if matches!(self.request.local, LocalLocation::Full(_)) {
            return Err(TransferError::AlreadyComplete("downloaded"));
        }
        let is_secret = self.request.encryption_key.is_secret();
        if self.request.remote.file_type.is_encrypted() && !is_secret {
            return Err(TransferError::MissingEncryptionKey);
        }
        if is_secret && (self.request.encryption_key.is_empty() || self.cipher.is_none()) {
            return Err(TransferError::MissingEncryptionKey);
        }
        if self.request.size > limits.max_file_size() {
            return Err(TransferError::TooBigFile {
                size: self.request.size,
            });
        }

        if is_secret && (self.request.offset != 0 || self.request.limit != 0) {
            // Chained decryption needs every part from the start.
            warn!(
                offset = self.request.offset,
                limit = self.request.limit,
                "ignoring streaming window for secret download"
            );
            self.request.offset = 0;
            self.request.limit = 0;
        }

        let mut info = FileInfo {
            size: self.request.size,
            expected_size: self.request.size,
            is_size_final: true,
            use_part_count_limit: true,
            need_delay: !self.request.is_small,
            ordered_flag: is_secret,
            offset: self.request.offset,
            limit: self.request.limit,
            ..FileInfo::default()
        };
        if let LocalLocation::Partial(partial) = self.request.local.clone() {
            if let Some((part_size, ready_parts)) = self.resume(&partial) {
                info.part_size = part_size;
                info.ready_parts = ready_parts;
            }
        }
        if is_secret && self.iv.is_empty() {
            self.iv = self.secret_key().map(|(_, iv)| iv.to_vec()).unwrap_or_default();
        }
        self.ready_iv = self.iv.clone();
        Ok(info)
    }

    fn on_start(&mut self) {
        self.callback.on_start();
    }

    fn start_part(&mut self, part: Part, parts: &PartsManager) -> TransferResult<PartStart> {
        self.ensure_file()?;
        let limit = parts.get_part_size();
        let class = self.query_class();
        let remote = &self.request.remote;

        let query = match &self.cdn {
            None => Query::new(
                remote.dc_id,
                class,
                Request::GetFile {
                    location: remote.clone(),
                    offset: part.offset,
                    limit,
                    cdn_supported: true,
                },
            ),
            Some(cdn) => match self.reupload_tokens.get(&part.id) {
                Some(request_token) => Query::new(
                    remote.dc_id,
                    class,
                    Request::ReuploadCdnFile {
                        file_token: cdn.file_token.clone(),
                        request_token: request_token.clone(),
                    },
                ),
                None => {
                    self.part_generation.insert(part.id, self.cdn_generation);
                    Query::new(
                        cdn.dc_id,
                        class,
                        Request::GetCdnFile {
                            file_token: cdn.file_token.clone(),
                            offset: part.offset,
                            limit,
                        },
                    )
                }
            },
        };
        Ok(PartStart::Query(query))
    }

    fn should_restart_part(&mut self, part: Part, result: &QueryResult) -> TransferResult<bool> {
        match result {
            Err(TransportError::Rpc { message, .. }) if message == "FILE_TOKEN_INVALID" => {
                self.count_refresh(part)?;
                debug!(part = part.id, "CDN file token expired");
                self.cdn = None;
                Ok(true)
            }
            Err(TransportError::Rpc { message, .. }) if message == "REQUEST_TOKEN_INVALID" => {
                self.count_refresh(part)?;
                self.reupload_tokens.remove(&part.id);
                Ok(true)
            }
            Ok(Response::CdnRedirect(redirect)) => {
                self.on_cdn_redirect(redirect)?;
                Ok(true)
            }
            Ok(Response::CdnReuploadNeeded { request_token }) => {
                self.reupload_tokens.insert(part.id, request_token.clone());
                Ok(true)
            }
            Ok(Response::FileHashes(hashes)) => {
                self.reupload_tokens.remove(&part.id);
                self.add_hashes(hashes);
                Ok(true)
            }
            Ok(Response::CdnFile(_)) => Ok(self.cdn.is_none()
                || self.part_generation.get(&part.id) != Some(&self.cdn_generation)),
            _ => Ok(false),
        }
    }

    fn process_part(
        &mut self,
        part: Part,
        result: QueryResult,
        parts: &PartsManager,
    ) -> TransferResult<PartApply> {
        let limit = parts.get_part_size();
        let mut data = match result? {
            Response::File(bytes) => bytes.to_vec(),
            Response::CdnFile(bytes) => {
                let (cdn, cipher) = match (&self.cdn, &self.cipher) {
                    (Some(cdn), Some(cipher)) => (cdn, cipher),
                    _ => return Err(TransferError::Internal("CDN part without session".into())),
                };
                let mut data = bytes.to_vec();
                cipher
                    .ctr_apply(&cdn.key, &cdn_part_iv(&cdn.iv, part.offset), &mut data)
                    .map_err(|e| TransferError::Cipher(e.0))?;
                data
            }
            other => {
                return Err(TransferError::Internal(format!(
                    "unexpected download response {:?}",
                    std::mem::discriminant(&other)
                )))
            }
        };

        if data.len() as i64 > limit {
            return Err(TransferError::InconsistentSize(format!(
                "part {} returned {} bytes, requested {limit}",
                part.id,
                data.len()
            )));
        }
        if data.is_empty() {
            return Ok(PartApply::Done(0));
        }

        if let FileEncryptionKey::Secret { key, .. } = &self.request.encryption_key {
            if data.len() % CIPHER_BLOCK_SIZE != 0 {
                return Err(TransferError::InconsistentSize(format!(
                    "encrypted part {} is not block aligned",
                    part.id
                )));
            }
            let cipher = self
                .cipher
                .as_ref()
                .ok_or(TransferError::MissingEncryptionKey)?;
            cipher
                .decrypt_chained(key, &mut self.iv, &mut data)
                .map_err(|e| TransferError::Cipher(e.0))?;
            self.part_ivs.insert(part.id, self.iv.clone());
        }
        data.truncate(part.size as usize);

        let file = self.ensure_file()?;
        Ok(PartApply::Write(Box::new(move || {
            file.write_at(part.offset, &data)
                .map_err(|e| TransferError::io(file.path(), e))?;
            Ok(data.len() as i64)
        })))
    }

    fn check_loop(
        &mut self,
        checked_prefix_size: i64,
        ready_prefix_size: i64,
        is_ready: bool,
    ) -> TransferResult<CheckInfo> {
        if !self.need_check {
            return Ok(CheckInfo::default());
        }
        let mut info = CheckInfo {
            need_check: true,
            checked_prefix_size,
            ..CheckInfo::default()
        };
        let Some(file) = self.file.clone() else {
            return Ok(info);
        };

        let offset = checked_prefix_size;
        if offset < ready_prefix_size {
            if let Some(hash) = self.hashes.get(&offset) {
                let mut end = hash.offset + hash.limit;
                if end > ready_prefix_size {
                    if !is_ready {
                        return Ok(info);
                    }
                    end = ready_prefix_size;
                }
                let expected = hash.hash.clone();
                info.verify = Some(Box::new(move || verify_range(&file, offset, end, &expected)));
                return Ok(info);
            }
        }

        let next = info.checked_prefix_size;
        if next < ready_prefix_size && !self.hashes.contains_key(&next) && !self.hash_query_pending
        {
            if let Some(cdn) = &self.cdn {
                self.hash_query_pending = true;
                info.queries.push(Query::new(
                    self.request.remote.dc_id,
                    self.query_class(),
                    Request::GetCdnFileHashes {
                        file_token: cdn.file_token.clone(),
                        offset: next,
                    },
                ));
            }
        }
        Ok(info)
    }

    fn process_check_query(&mut self, result: QueryResult) -> TransferResult<()> {
        self.hash_query_pending = false;
        match result {
            Ok(Response::FileHashes(hashes)) => {
                self.add_hashes(&hashes);
                Ok(())
            }
            Err(TransportError::Canceled) => Ok(()),
            Err(error) => Err(error.into()),
            Ok(_) => Err(TransferError::Internal(
                "unexpected reply to hash request".into(),
            )),
        }
    }

    fn on_progress(&mut self, progress: Progress) {
        self.callback.on_progress(&progress);
        if progress.is_ready || progress.ready_size == 0 {
            return;
        }
        let Some(file) = &self.file else {
            return;
        };
        let (iv, ready_bitmask) = if self.request.encryption_key.is_secret() {
            while let Some(entry) = self.part_ivs.first_entry() {
                if *entry.key() >= progress.ready_part_count {
                    break;
                }
                self.ready_iv = entry.remove();
            }
            (
                self.ready_iv.clone(),
                Bitmask::ones(progress.ready_part_count).encode(None),
            )
        } else {
            (Vec::new(), progress.ready_bitmask)
        };
        self.callback.on_partial_download(
            PartialLocalLocation {
                file_type: self.request.remote.file_type,
                path: file.path(),
                part_size: progress.part_size,
                iv,
                ready_bitmask,
                ready_size: progress.ready_size,
            },
            progress.ready_size,
            progress.size,
        );
    }

    fn publish(&mut self, _parts: &PartsManager) -> TransferResult<BlockingJob<FullLocalLocation>> {
        let file = self.ensure_file()?;
        self.file = None;
        let file_type = self.request.remote.file_type;
        let dir = self.config.files_dir.join(file_type.dir_name());
        let name = self.file_name();
        Ok(Box::new(move || {
            let temp = file.path();
            file.sync().map_err(|e| TransferError::io(&temp, e))?;
            file.close();
            fs::create_dir_all(&dir).map_err(|e| TransferError::io(&dir, e))?;
            let target = unique_path(&dir, &name);
            move_file(&temp, &target)?;
            Ok(FullLocalLocation {
                file_type,
                mtime_nsec: mtime_nsec(&target),
                path: target,
            })
        }))
    }

    fn on_ok(&mut self, location: FullLocalLocation, parts: &PartsManager) -> TransferResult<()> {
        let size = parts.get_size_or_zero();
        info!(path = %location.path.display(), size, "download published");
        self.callback.on_ok(location, size, true);
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
    part_size > 0 && part_size <= MAX_RESUME_PART_SIZE && part_size & (part_size - 1) == 0
}

/// Last path component of `name` with characters unsafe in file names
/// replaced. `None` if nothing usable remains.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let clean: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let clean = clean.trim();
    if clean.is_empty() || clean == "." || clean == ".." {
        return None;
    }
    Some(clean.to_string())
}

/// Reads `offset..end` and compares its SHA-256 with `expected`.
fn verify_range(file: &LazyFile, offset: i64, end: i64, expected: &[u8]) -> TransferResult<i64> {
    let data = file
        .read_at(offset, (end - offset) as usize)
        .map_err(|e| TransferError::io(file.path(), e))?;
    if data.len() as i64 != end - offset {
        return Err(TransferError::InconsistentSize(format!(
            "file is shorter than verified range at {offset}"
        )));
    }
    if sha256(&data)[..] != expected[..] {
        return Err(TransferError::HashMismatch { offset });
    }
    trace!(offset, end, "range verified");
    Ok(end)
}

/// Moves `from` to `to`, copying across filesystems.
fn move_file(from: &Path, to: &Path) -> TransferResult<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| TransferError::io(to, e))?;
    if let Err(e) = fs::remove_file(from) {
        warn!(path = %from.display(), error = %e, "failed to remove temp file");
    }
    Ok(())
}

fn mtime_nsec(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
