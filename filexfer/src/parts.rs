//! Part-indexing state machine for one transfer.
//!
//! A file is cut into parts of `part_size` bytes (the last one possibly
//! shorter). Every part moves through:
//!
//! ```text
//!            start_part            on_part_ok
//!   Empty ───────────────► Pending ───────────► Ready
//!     ▲                       │
//!     └───── on_part_failed ──┘
//! ```
//!
//! The manager also handles files whose size is not known yet (generated
//! files, streamed uploads): the size is inferred from short parts, or
//! announced through [`PartsManager::set_known_prefix`]. A streaming window
//! `[offset, offset + limit)` re-centres assignment for seek-driven
//! downloads.

use crate::bitmask::Bitmask;
use crate::error::{TransferError, TransferResult};
use tracing::{debug, warn};

// =============================================================================
// Limits
// =============================================================================

/// Largest part size accepted by the remote side (512 KiB).
pub const MAX_PART_SIZE: i64 = 512 << 10;

/// Maximum part count for regular accounts.
pub const MAX_PART_COUNT: usize = 4000;

/// Maximum part count for privileged accounts.
pub const MAX_PART_COUNT_PREMIUM: usize = 8000;

/// Initial part size for files of known size.
const INITIAL_PART_SIZE: i64 = 64 << 10;

/// Initial part size for files of unknown size.
const INITIAL_UNKNOWN_PART_SIZE: i64 = 32 << 10;

/// Minimum expected size assumed while the real size is unknown.
const MIN_EXPECTED_UNKNOWN_SIZE: i64 = 512 << 10;

/// Part count and part size limits for one account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartLimits {
    /// Maximum number of parts a file may be split into.
    pub max_part_count: usize,
    /// Maximum size of a single automatically sized part.
    pub max_part_size: i64,
}

impl PartLimits {
    /// Limits for a regular account.
    pub fn regular() -> Self {
        Self {
            max_part_count: MAX_PART_COUNT,
            max_part_size: MAX_PART_SIZE,
        }
    }

    /// Limits for a privileged account.
    pub fn premium() -> Self {
        Self {
            max_part_count: MAX_PART_COUNT_PREMIUM,
            max_part_size: MAX_PART_SIZE,
        }
    }

    /// Largest transferable file: `max_part_count * max_part_size`.
    pub fn max_file_size(&self) -> i64 {
        self.max_part_count as i64 * self.max_part_size
    }
}

impl Default for PartLimits {
    fn default() -> Self {
        Self::regular()
    }
}

// =============================================================================
// Part
// =============================================================================

/// Assignment status of one part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartStatus {
    Empty,
    Pending,
    Ready,
}

/// One contiguous byte range of the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Part {
    pub id: usize,
    pub offset: i64,
    pub size: i64,
}

fn calc_part_count(size: i64, part_size: i64) -> usize {
    assert!(part_size > 0, "part size must be positive");
    ((size + part_size - 1) / part_size) as usize
}

// =============================================================================
// Parts Manager
// =============================================================================

/// Tracks which parts are assignable, in flight, or ready.
#[derive(Debug)]
pub struct PartsManager {
    limits: PartLimits,
    is_upload: bool,
    use_part_count_limit: bool,

    need_check: bool,
    checked_prefix_size: i64,

    known_prefix_flag: bool,
    known_prefix_size: i64,

    size: i64,
    expected_size: i64,
    min_size: i64,
    max_size: i64,
    unknown_size_flag: bool,

    ready_size: i64,
    streaming_ready_size: i64,

    part_size: i64,
    part_count: usize,
    pending_count: usize,
    first_empty_part: usize,
    first_not_ready_part: usize,

    streaming_offset: i64,
    streaming_limit: i64,
    first_streaming_empty_part: usize,
    first_streaming_not_ready_part: usize,

    part_status: Vec<PartStatus>,
    bitmask: Bitmask,
}

impl PartsManager {
    /// Creates an uninitialized manager bound to the given limits.
    pub fn new(limits: PartLimits) -> Self {
        Self {
            limits,
            is_upload: false,
            use_part_count_limit: true,
            need_check: false,
            checked_prefix_size: 0,
            known_prefix_flag: false,
            known_prefix_size: 0,
            size: 0,
            expected_size: 0,
            min_size: 0,
            max_size: 0,
            unknown_size_flag: false,
            ready_size: 0,
            streaming_ready_size: 0,
            part_size: 0,
            part_count: 0,
            pending_count: 0,
            first_empty_part: 0,
            first_not_ready_part: 0,
            streaming_offset: 0,
            streaming_limit: 0,
            first_streaming_empty_part: 0,
            first_streaming_not_ready_part: 0,
            part_status: Vec::new(),
            bitmask: Bitmask::new(),
        }
    }

    /// Initializes the part layout.
    ///
    /// `part_size == 0` selects a part size automatically: the smallest power
    /// of two from 64 KiB that keeps the part count within limits. When
    /// `is_size_final` is false, `size` is only a known prefix of a file that
    /// is still growing.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        size: i64,
        expected_size: i64,
        is_size_final: bool,
        part_size: i64,
        ready_parts: &[usize],
        use_part_count_limit: bool,
        is_upload: bool,
    ) -> TransferResult<()> {
        assert!(size >= 0, "negative size {size}");
        self.is_upload = is_upload;
        self.use_part_count_limit = use_part_count_limit;
        self.expected_size = expected_size.max(size);

        if use_part_count_limit && self.expected_size > self.limits.max_file_size() {
            return Err(TransferError::TooBigFile {
                size: self.expected_size,
            });
        }

        if !is_size_final {
            return self.init_known_prefix(size, part_size, ready_parts);
        }
        if size == 0 {
            return self.init_no_size(part_size, ready_parts);
        }

        self.unknown_size_flag = false;
        self.known_prefix_flag = false;
        self.size = size;

        if part_size != 0 {
            self.part_size = part_size;
            if use_part_count_limit
                && calc_part_count(self.expected_size, self.part_size) > self.limits.max_part_count
            {
                if is_upload {
                    return Err(TransferError::UploadRestart);
                }
                return Err(TransferError::TooBigFile {
                    size: self.expected_size,
                });
            }
        } else {
            self.part_size = INITIAL_PART_SIZE;
            while use_part_count_limit
                && calc_part_count(self.expected_size, self.part_size) > self.limits.max_part_count
            {
                self.part_size *= 2;
                if self.part_size > self.limits.max_part_size {
                    return Err(TransferError::TooBigFile {
                        size: self.expected_size,
                    });
                }
            }
        }

        self.part_count = calc_part_count(self.size, self.part_size);
        self.init_common(ready_parts)
    }

    fn init_known_prefix(
        &mut self,
        known_prefix: i64,
        part_size: i64,
        ready_parts: &[usize],
    ) -> TransferResult<()> {
        self.known_prefix_flag = true;
        self.known_prefix_size = known_prefix;
        self.init_no_size(part_size, ready_parts)
    }

    fn init_no_size(&mut self, part_size: i64, ready_parts: &[usize]) -> TransferResult<()> {
        self.unknown_size_flag = true;
        self.size = 0;
        self.min_size = 0;
        self.max_size = i64::MAX;

        if part_size != 0 {
            self.part_size = part_size;
        } else {
            self.part_size = INITIAL_UNKNOWN_PART_SIZE;
            while self.use_part_count_limit
                && calc_part_count(self.expected_size, self.part_size) > self.limits.max_part_count
            {
                self.part_size *= 2;
                if self.part_size > self.limits.max_part_size {
                    return Err(TransferError::TooBigFile {
                        size: self.expected_size,
                    });
                }
            }
            // The expected size is only a hint; leave headroom for growth.
            if self.part_size < self.limits.max_part_size {
                self.part_size *= 2;
            }
        }

        self.part_count = 0;
        if self.known_prefix_flag {
            self.part_count = (self.known_prefix_size / self.part_size) as usize;
        }
        if let Some(max_ready) = ready_parts.iter().max() {
            self.part_count = self.part_count.max(max_ready + 1);
        }
        self.init_common(ready_parts)
    }

    fn init_common(&mut self, ready_parts: &[usize]) -> TransferResult<()> {
        self.ready_size = 0;
        self.streaming_ready_size = 0;
        self.pending_count = 0;
        self.first_empty_part = 0;
        self.first_not_ready_part = 0;
        self.first_streaming_empty_part = 0;
        self.first_streaming_not_ready_part = 0;
        self.part_status = vec![PartStatus::Empty; self.part_count];
        self.bitmask = Bitmask::new();

        if self.use_part_count_limit && self.part_count > self.limits.max_part_count {
            if self.is_upload {
                return Err(TransferError::UploadRestart);
            }
            return Err(TransferError::TooBigFile {
                size: self.expected_size,
            });
        }

        for &part_id in ready_parts {
            if part_id >= self.part_count {
                if self.is_upload {
                    return Err(TransferError::UploadRestart);
                }
                return Err(TransferError::InvalidReadyPart {
                    part: part_id,
                    part_count: self.part_count,
                });
            }
            if self.part_status[part_id] == PartStatus::Ready {
                continue;
            }
            self.part_status[part_id] = PartStatus::Ready;
            self.bitmask.set(part_id);
            self.ready_size += self.get_part(part_id).size;
        }

        self.update_first_empty_part();
        self.update_first_not_ready_part();
        debug!(
            part_size = self.part_size,
            part_count = self.part_count,
            ready_size = self.ready_size,
            unknown_size = self.unknown_size_flag,
            "parts initialized"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Assignment
    // -------------------------------------------------------------------------

    /// Assigns the next part, marking it `Pending`.
    ///
    /// Returns `Ok(None)` when nothing is assignable right now: every part is
    /// taken, the streaming window is exhausted, or the next part lies beyond
    /// the known prefix of a growing file.
    pub fn start_part(&mut self) -> TransferResult<Option<Part>> {
        self.update_first_empty_part();
        let mut part_id = self.first_streaming_empty_part;

        if self.known_prefix_flag && part_id >= (self.known_prefix_size / self.part_size) as usize
        {
            return Ok(None);
        }

        if part_id == self.part_count {
            if self.unknown_size_flag {
                self.part_count += 1;
                if self.use_part_count_limit && self.part_count > self.limits.max_part_count {
                    if self.is_upload {
                        return Err(TransferError::UploadRestart);
                    }
                    return Err(TransferError::TooBigFile {
                        size: self.part_count as i64 * self.part_size,
                    });
                }
                self.part_status.push(PartStatus::Empty);
            } else if self.first_empty_part < self.part_count {
                part_id = self.first_empty_part;
            } else {
                return Ok(None);
            }
        }

        if !self.is_part_in_streaming_limit(part_id) {
            return Ok(None);
        }

        assert_eq!(
            self.part_status[part_id],
            PartStatus::Empty,
            "part {part_id} assigned twice"
        );
        self.part_status[part_id] = PartStatus::Pending;
        self.pending_count += 1;
        Ok(Some(self.get_part(part_id)))
    }

    /// Marks a pending part ready with `actual_size` bytes transferred.
    ///
    /// For files of unknown size a short part fixes the upper bound of the
    /// size and a non-empty part raises the lower bound; once both meet, the
    /// size becomes final.
    pub fn on_part_ok(
        &mut self,
        part_id: usize,
        part_size: i64,
        actual_size: i64,
    ) -> TransferResult<()> {
        assert_eq!(
            self.part_status[part_id],
            PartStatus::Pending,
            "part {part_id} completed while not pending"
        );
        self.pending_count -= 1;
        self.part_status[part_id] = PartStatus::Ready;
        if actual_size != 0 {
            self.bitmask.set(part_id);
        }
        self.ready_size += actual_size;
        if self.streaming_limit > 0 && self.is_part_in_streaming_limit(part_id) {
            self.streaming_ready_size += actual_size;
        }

        if actual_size > part_size {
            return Err(TransferError::InconsistentSize(format!(
                "received {actual_size} bytes for part {part_id} of size {part_size}"
            )));
        }

        let part_end = part_id as i64 * self.part_size + actual_size;
        if self.unknown_size_flag {
            assert_eq!(part_size, self.part_size);
            if actual_size < self.part_size {
                self.max_size = self.max_size.min(part_end);
            }
            if actual_size != 0 {
                self.min_size = self.min_size.max(part_end);
            }
            if self.min_size > self.max_size {
                return Err(TransferError::InconsistentSize(format!(
                    "size lower bound {} exceeds upper bound {}",
                    self.min_size, self.max_size
                )));
            } else if self.min_size == self.max_size {
                debug!(size = self.min_size, "file size inferred");
                self.unknown_size_flag = false;
                self.size = self.min_size;
            }
        } else if actual_size < part_size && part_id + 1 < self.part_count {
            return Err(TransferError::InconsistentSize(format!(
                "short part {part_id}: {actual_size} of {part_size} bytes"
            )));
        }
        Ok(())
    }

    /// Returns a pending part to `Empty` so it is assigned again.
    pub fn on_part_failed(&mut self, part_id: usize) {
        assert_eq!(
            self.part_status[part_id],
            PartStatus::Pending,
            "part {part_id} failed while not pending"
        );
        self.pending_count -= 1;
        self.part_status[part_id] = PartStatus::Empty;
        if part_id < self.first_empty_part {
            self.first_empty_part = part_id;
        }
        if self.streaming_offset == 0 {
            self.first_streaming_empty_part = self.first_empty_part;
            return;
        }
        let window_part = (self.streaming_offset / self.part_size) as usize;
        if part_id >= window_part && part_id < self.first_streaming_empty_part {
            self.first_streaming_empty_part = part_id;
        }
    }

    // -------------------------------------------------------------------------
    // Size knowledge
    // -------------------------------------------------------------------------

    /// Extends the known prefix of a growing file; `is_ready` makes it final.
    pub fn set_known_prefix(&mut self, size: i64, is_ready: bool) -> TransferResult<()> {
        if !self.known_prefix_flag || size < self.known_prefix_size {
            warn!(
                size,
                known_prefix = self.known_prefix_size,
                "ignoring known prefix update"
            );
            return Ok(());
        }
        self.known_prefix_size = size;
        self.expected_size = self.expected_size.max(size);

        if is_ready {
            self.part_count = calc_part_count(size, self.part_size);
            self.size = size;
            self.unknown_size_flag = false;
            self.known_prefix_flag = false;
        } else {
            self.part_count = (size / self.part_size) as usize;
        }
        self.part_count = self.part_count.max(self.part_status.len());
        self.part_status.resize(self.part_count, PartStatus::Empty);

        if self.use_part_count_limit
            && calc_part_count(self.expected_size, self.part_size) > self.limits.max_part_count
        {
            if self.is_upload {
                return Err(TransferError::UploadRestart);
            }
            return Err(TransferError::TooBigFile {
                size: self.expected_size,
            });
        }
        Ok(())
    }

    /// Requires ready data to be verified before the transfer may finish.
    pub fn set_need_check(&mut self) {
        self.need_check = true;
        self.set_streaming_offset(0, 0);
    }

    /// Records that bytes `0..size` were verified.
    pub fn set_checked_prefix_size(&mut self, size: i64) {
        self.checked_prefix_size = size;
    }

    pub fn get_checked_prefix_size(&self) -> i64 {
        self.checked_prefix_size
    }

    pub fn need_check(&self) -> bool {
        self.need_check
    }

    // -------------------------------------------------------------------------
    // Streaming window
    // -------------------------------------------------------------------------

    /// Re-centres assignment on `[offset, offset + limit)`.
    ///
    /// Returns the first empty part inside the new window. Offsets that are
    /// negative, past the end, or requested while verification is pending are
    /// ignored and reset the window to the start.
    pub fn set_streaming_offset(&mut self, offset: i64, limit: i64) -> usize {
        let out_of_range = offset < 0
            || self.need_check
            || (!self.unknown_size_flag && self.size < offset)
            || (self.part_size > 0
                && self.use_part_count_limit
                && (offset / self.part_size) as usize >= self.limits.max_part_count);

        if out_of_range || self.part_size == 0 {
            if offset != 0 {
                warn!(offset, "ignoring streaming offset");
            }
            self.streaming_offset = 0;
        } else {
            self.streaming_offset = offset;
            let part_id = (offset / self.part_size) as usize;
            self.first_streaming_empty_part = part_id;
            self.first_streaming_not_ready_part = part_id;
            if self.part_count < part_id {
                self.part_count = part_id;
                self.part_status.resize(self.part_count, PartStatus::Empty);
            }
        }

        self.set_streaming_limit(limit);
        self.update_first_empty_part();
        self.update_first_not_ready_part();
        self.first_streaming_empty_part
    }

    /// Sets the window length; zero disables the limit.
    pub fn set_streaming_limit(&mut self, limit: i64) {
        self.streaming_limit = limit;
        self.streaming_ready_size = 0;
        if self.streaming_limit == 0 {
            return;
        }
        for part_id in 0..self.part_count {
            if self.part_status[part_id] == PartStatus::Ready
                && self.is_part_in_streaming_limit(part_id)
            {
                self.streaming_ready_size += self.get_part(part_id).size;
            }
        }
    }

    pub fn get_streaming_offset(&self) -> i64 {
        self.streaming_offset
    }

    pub fn get_streaming_limit(&self) -> i64 {
        self.streaming_limit
    }

    /// Returns true if `part_id` intersects the streaming window.
    ///
    /// For files of known size the window wraps around to the beginning.
    pub fn is_part_in_streaming_limit(&self, part_id: usize) -> bool {
        assert!(part_id < self.part_count);
        let part = self.get_part(part_id);
        let offset_begin = part.offset;
        let offset_end = offset_begin + part.size;

        if offset_begin >= self.get_expected_size() {
            return false;
        }
        if self.streaming_limit == 0 {
            return true;
        }

        let intersects =
            |begin: i64, end: i64| begin.max(offset_begin) < end.min(offset_end);
        let streaming_begin = self.streaming_offset;
        let streaming_end = self.streaming_offset + self.streaming_limit;
        if intersects(streaming_begin, streaming_end) {
            return true;
        }
        !self.unknown_size_flag
            && streaming_end > self.size
            && intersects(0, streaming_end - self.size)
    }

    /// Returns true when every part inside the window is ready.
    pub fn is_streaming_limit_reached(&mut self) -> bool {
        if self.streaming_limit == 0 {
            return false;
        }
        self.update_first_not_ready_part();
        let mut part_id = self.first_streaming_not_ready_part;
        if !self.unknown_size_flag && part_id == self.part_count {
            part_id = self.first_not_ready_part;
        }
        if part_id == self.part_count {
            return false;
        }
        !self.is_part_in_streaming_limit(part_id)
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    /// Every byte transferred, ignoring verification.
    pub fn unchecked_ready(&self) -> bool {
        !self.unknown_size_flag && self.ready_size == self.size
    }

    /// Every byte transferred and, when required, verified.
    pub fn ready(&self) -> bool {
        self.unchecked_ready() && (!self.need_check || self.checked_prefix_size == self.size)
    }

    /// The transfer may stop: either ready, or the streaming window is done.
    pub fn may_finish(&mut self) -> bool {
        self.is_streaming_limit_reached() || self.ready()
    }

    /// Confirms the transfer may be finalized.
    pub fn finish(&mut self) -> TransferResult<()> {
        if self.ready() {
            return Ok(());
        }
        if self.is_streaming_limit_reached() {
            return Err(TransferError::DownloadLimit);
        }
        Err(TransferError::NotFinished)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Byte range of `part_id`, clamped to the (possibly inferred) file end.
    pub fn get_part(&self, part_id: usize) -> Part {
        let offset = self.part_size * part_id as i64;
        let total = if self.unknown_size_flag {
            self.max_size
        } else {
            self.size
        };
        let mut size = self.part_size;
        if total < offset.saturating_add(size) {
            size = (total - offset).max(0);
        }
        Part {
            id: part_id,
            offset,
            size,
        }
    }

    /// Number of leading ready parts, capped by the verified prefix.
    pub fn get_ready_prefix_count(&mut self) -> usize {
        self.update_first_not_ready_part();
        if self.need_check {
            let checked_parts = (self.checked_prefix_size / self.part_size) as usize;
            if checked_parts < self.first_not_ready_part {
                return checked_parts;
            }
        }
        self.first_not_ready_part
    }

    /// Byte length of the leading run of ready parts, ignoring verification.
    pub fn get_unchecked_ready_prefix_size(&mut self) -> i64 {
        self.update_first_not_ready_part();
        if self.first_not_ready_part == 0 {
            return 0;
        }
        let part = self.get_part(self.first_not_ready_part - 1);
        part.offset + part.size
    }

    /// Encoded readiness bitmask, limited to the verified prefix if needed.
    pub fn get_bitmask(&mut self) -> Vec<u8> {
        if self.need_check {
            let prefix_count = self.get_ready_prefix_count();
            return self.bitmask.encode(Some(prefix_count));
        }
        self.bitmask.encode(None)
    }

    /// Bytes still wanted: the rest of the file, or of the streaming window.
    pub fn get_estimated_extra(&self) -> i64 {
        let expected_size = self.get_expected_size();
        if self.streaming_limit == 0 {
            return (expected_size - self.ready_size).max(0);
        }

        let part_size = self.part_size;
        let streaming_begin = self.streaming_offset / part_size * part_size;
        let streaming_end =
            (self.streaming_offset + self.streaming_limit + part_size - 1) / part_size * part_size;
        let mut streaming_size = (streaming_end.min(expected_size) - streaming_begin).max(0);
        if !self.unknown_size_flag && streaming_end > expected_size {
            streaming_size += (streaming_end - expected_size).min(streaming_begin);
        }
        (streaming_size - self.streaming_ready_size).max(0)
    }

    /// Final size, or 0 while unknown.
    pub fn get_size_or_zero(&self) -> i64 {
        if self.unknown_size_flag {
            0
        } else {
            self.size
        }
    }

    /// Best guess of the final size.
    pub fn get_expected_size(&self) -> i64 {
        if self.unknown_size_flag {
            MIN_EXPECTED_UNKNOWN_SIZE.max(self.ready_size * 2)
        } else {
            self.size
        }
    }

    pub fn is_size_known(&self) -> bool {
        !self.unknown_size_flag
    }

    pub fn get_ready_size(&self) -> i64 {
        self.ready_size
    }

    pub fn get_part_size(&self) -> i64 {
        self.part_size
    }

    pub fn get_part_count(&self) -> usize {
        self.part_count
    }

    pub fn get_pending_count(&self) -> usize {
        self.pending_count
    }

    pub fn get_part_status(&self, part_id: usize) -> Option<PartStatus> {
        self.part_status.get(part_id).copied()
    }

    fn update_first_empty_part(&mut self) {
        while self.first_empty_part < self.part_count
            && self.part_status[self.first_empty_part] != PartStatus::Empty
        {
            self.first_empty_part += 1;
        }
        if self.streaming_offset == 0 {
            self.first_streaming_empty_part = self.first_empty_part;
            return;
        }
        while self.first_streaming_empty_part < self.part_count
            && self.part_status[self.first_streaming_empty_part] != PartStatus::Empty
        {
            self.first_streaming_empty_part += 1;
        }
    }

    fn update_first_not_ready_part(&mut self) {
        while self.first_not_ready_part < self.part_count
            && self.part_status[self.first_not_ready_part] == PartStatus::Ready
        {
            self.first_not_ready_part += 1;
        }
        if self.streaming_offset == 0 {
            self.first_streaming_not_ready_part = self.first_not_ready_part;
            return;
        }
        while self.first_streaming_not_ready_part < self.part_count
            && self.part_status[self.first_streaming_not_ready_part] == PartStatus::Ready
        {
            self.first_streaming_not_ready_part += 1;
        }
    }
}
