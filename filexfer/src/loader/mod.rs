//! Per-file transfer state machine.
//!
//! # Architecture
//!
//! ```text
//!             ResourceManager ──UpdateResources──┐
//!                                                 ▼
//!   FileLoaderHandle ──messages──►  FileLoader<B> task
//!                                    │
//!                                    ├── PartsManager      (which parts next)
//!                                    ├── ResourceState     (may we start one)
//!                                    ├── DelayDispatcher   (optional spacing)
//!                                    └── B: LoaderBackend  (download / upload)
//!                                           │
//!                                           ▼
//!                                   Dispatch ──► Transport
//! ```
//!
//! The driver owns the generic part loop: start parts while budget allows,
//! route results back to the backend, retry transient failures, apply results
//! in part order when the backend needs it, and finalize once every part is
//! ready. Backends supply the request/response semantics.

mod download;
mod file;
mod upload;

pub(crate) use download::{DownloadRequest, Downloader};
pub(crate) use upload::{UploadRequest, Uploader};

use crate::config::TransferConfig;
use crate::crypto::FileCipher;
use crate::error::{TransferError, TransferResult, TransportError};
use crate::location::{FileType, FullLocalLocation, LocalLocation, PartialLocalLocation, PartialRemoteLocation};
use crate::net::{DelayDispatcher, DelayDispatcherHandle, Dispatch, Query, QueryResult};
use crate::ordered::OrderedEventsProcessor;
use crate::parts::{Part, PartLimits, PartsManager};
use crate::resource::{ResourceLease, ResourceManagerHandle, ResourceState, ResourceWorker};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use futures::future::OptionFuture;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

// =============================================================================
// Public surface
// =============================================================================

/// Snapshot of a transfer's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub part_count: usize,
    pub part_size: i64,
    /// Length of the ready prefix, in parts.
    pub ready_part_count: usize,
    /// Encoded [`Bitmask`](crate::bitmask::Bitmask) of ready parts.
    pub ready_bitmask: Vec<u8>,
    pub is_ready: bool,
    pub ready_size: i64,
    /// Total size, or 0 while unknown.
    pub size: i64,
}

/// Receives the outcome of a download. Exactly one of `on_ok` and
/// `on_error` is called, and nothing after it.
pub trait DownloadCallback: Send + 'static {
    /// The first part request was issued.
    fn on_start(&mut self) {}

    fn on_progress(&mut self, _progress: &Progress) {}

    /// Resumable state after new data arrived; not called once ready.
    fn on_partial_download(&mut self, partial: PartialLocalLocation, ready_size: i64, size: i64);

    fn on_ok(&mut self, location: FullLocalLocation, size: i64, is_new: bool);

    fn on_error(&mut self, error: TransferError);
}

/// Receives the outcome of an upload. Exactly one of `on_ok` and `on_error`
/// is called, and nothing after it.
pub trait UploadCallback: Send + 'static {
    fn on_progress(&mut self, _progress: &Progress) {}

    /// Resumable state after a part was accepted.
    fn on_partial_upload(&mut self, partial: PartialRemoteLocation, ready_size: i64);

    fn on_ok(&mut self, file_type: FileType, partial: PartialRemoteLocation, size: i64);

    fn on_error(&mut self, error: TransferError);
}

/// Lifecycle of a loader, for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderState {
    Initializing,
    Transferring,
    AwaitingBudget,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

// =============================================================================
// Backend contract
// =============================================================================

/// What a backend needs to get the part loop going.
#[derive(Clone, Debug, Default)]
pub(crate) struct FileInfo {
    pub size: i64,
    pub expected_size: i64,
    pub is_size_final: bool,
    /// 0 chooses automatically.
    pub part_size: i64,
    pub ready_parts: Vec<usize>,
    pub use_part_count_limit: bool,
    pub is_upload: bool,
    /// Space requests through a delay dispatcher.
    pub need_delay: bool,
    /// Apply results in part order.
    pub ordered_flag: bool,
    /// Dispatch prepared parts in the order they were started.
    pub ordered_dispatch: bool,
    pub offset: i64,
    pub limit: i64,
}

/// Known local prefix of an upload source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PrefixInfo {
    pub size: i64,
    pub is_ready: bool,
}

/// Disk work run on the blocking pool.
pub(crate) type BlockingJob<T> = Box<dyn FnOnce() -> TransferResult<T> + Send + 'static>;

/// Blocking job producing a part's payload.
pub(crate) type PrepareJob = BlockingJob<Vec<u8>>;

pub(crate) enum PartStart {
    /// Send this query now.
    Query(Query),
    /// Run the job off the loader task, then call `on_part_prepared`.
    Prepare(PrepareJob),
}

/// What happens to a part's result after the backend consumed it.
pub(crate) enum PartApply {
    /// Bytes the part carried.
    Done(i64),
    /// Store the data first; the job returns the bytes written.
    Write(BlockingJob<i64>),
}

/// Outcome of a verification pass.
#[derive(Default)]
pub(crate) struct CheckInfo {
    pub need_check: bool,
    pub checked_prefix_size: i64,
    /// Extra requests needed to continue verification.
    pub queries: Vec<Query>,
    /// Verifies the next range, returning the new checked prefix size.
    pub verify: Option<BlockingJob<i64>>,
}

/// Direction-specific half of a loader.
pub(crate) trait LoaderBackend: Send + 'static {
    /// Result of finalizing the local file.
    type Published: Send + 'static;

    fn kind(&self) -> &'static str;

    fn init(&mut self, limits: PartLimits) -> TransferResult<FileInfo>;

    /// The source file grew or moved. Returns the new known prefix.
    fn on_update_local_location(
        &mut self,
        _location: &LocalLocation,
    ) -> TransferResult<Option<PrefixInfo>> {
        Ok(None)
    }

    fn on_start(&mut self) {}

    fn start_part(&mut self, part: Part, parts: &PartsManager) -> TransferResult<PartStart>;

    fn on_part_prepared(
        &mut self,
        _part: Part,
        _data: Vec<u8>,
        _parts: &PartsManager,
    ) -> TransferResult<Query> {
        Err(TransferError::Internal(format!(
            "{} loader does not prepare parts",
            self.kind()
        )))
    }

    /// True if the result is a redirection and the part must be reissued.
    fn should_restart_part(&mut self, _part: Part, _result: &QueryResult) -> TransferResult<bool> {
        Ok(false)
    }

    /// Consumes a part's result.
    fn process_part(
        &mut self,
        part: Part,
        result: QueryResult,
        parts: &PartsManager,
    ) -> TransferResult<PartApply>;

    fn check_loop(
        &mut self,
        _checked_prefix_size: i64,
        _ready_prefix_size: i64,
        _is_ready: bool,
    ) -> TransferResult<CheckInfo> {
        Ok(CheckInfo::default())
    }

    fn process_check_query(&mut self, _result: QueryResult) -> TransferResult<()> {
        Ok(())
    }

    fn on_progress(&mut self, progress: Progress);

    /// Blocking work finalizing a transfer whose parts are all ready.
    fn publish(&mut self, parts: &PartsManager) -> TransferResult<BlockingJob<Self::Published>>;

    /// Reports a finished transfer once `publish` succeeded.
    fn on_ok(&mut self, published: Self::Published, parts: &PartsManager) -> TransferResult<()>;

    fn on_error(&mut self, error: TransferError);

    /// When an open file handle becomes idle.
    fn idle_deadline(&self) -> Option<tokio::time::Instant> {
        None
    }

    fn release_idle_file(&mut self) {}

    /// Releases files; called on every exit path.
    fn close(&mut self) {}
}

// =============================================================================
// Messages and handle
// =============================================================================

pub(crate) enum LoaderMessage {
    UpdateResources(ResourceState),
    QueryResult {
        query_id: u64,
        result: QueryResult,
    },
    CheckResult {
        query_id: u64,
        result: QueryResult,
    },
    PartPrepared {
        seq: u64,
        part: Part,
        result: TransferResult<Vec<u8>>,
    },
    PartWritten {
        part: Part,
        result: TransferResult<i64>,
    },
    Verified(TransferResult<i64>),
    RetryPart {
        part_id: usize,
    },
    UpdatePriority(i8),
    UpdateLocalLocation(LocalLocation),
    UpdateDownloadedPart {
        offset: i64,
        limit: i64,
    },
}

struct LoaderWorker {
    tx: mpsc::UnboundedSender<LoaderMessage>,
}

impl ResourceWorker for LoaderWorker {
    fn update_resources(&self, state: ResourceState) {
        let _ = self.tx.send(LoaderMessage::UpdateResources(state));
    }
}

/// Shared collaborators of every loader.
#[derive(Clone)]
pub(crate) struct LoaderContext {
    pub config: Arc<TransferConfig>,
    pub dispatcher: Arc<dyn Dispatch>,
    pub cipher: Option<Arc<dyn FileCipher>>,
}

/// Owner's handle to a running loader. Dropping it cancels the loader.
pub(crate) struct FileLoaderHandle {
    tx: mpsc::UnboundedSender<LoaderMessage>,
    join: JoinHandle<()>,
    guard: DropGuard,
}

impl FileLoaderHandle {
    pub(crate) fn update_priority(&self, priority: i8) {
        let _ = self.tx.send(LoaderMessage::UpdatePriority(priority));
    }

    pub(crate) fn update_local_location(&self, location: LocalLocation) {
        let _ = self.tx.send(LoaderMessage::UpdateLocalLocation(location));
    }

    pub(crate) fn update_downloaded_part(&self, offset: i64, limit: i64) {
        let _ = self
            .tx
            .send(LoaderMessage::UpdateDownloadedPart { offset, limit });
    }

    /// Cancels the loader, returning its task so the caller can await it.
    pub(crate) fn shutdown(self) -> JoinHandle<()> {
        let Self { join, guard, .. } = self;
        drop(guard);
        join
    }
}

/// Spawns a loader for `backend`, registered with `resources`.
pub(crate) fn spawn_loader<B: LoaderBackend>(
    backend: B,
    ctx: LoaderContext,
    resources: &ResourceManagerHandle,
    priority: i8,
) -> FileLoaderHandle {
    let (tx, inbox) = mpsc::unbounded_channel();
    let lease = resources.register_worker(Box::new(LoaderWorker { tx: tx.clone() }), priority);
    let cancel = CancellationToken::new();
    let loader = FileLoader::new(backend, ctx, lease, inbox, tx.clone(), cancel.clone());
    let join = tokio::spawn(loader.run());
    FileLoaderHandle {
        tx,
        join,
        guard: cancel.drop_guard(),
    }
}

// =============================================================================
// Driver
// =============================================================================

struct InFlight {
    part: Part,
    cancel: CancellationToken,
}

pub(crate) struct FileLoader<B: LoaderBackend> {
    backend: B,
    ctx: LoaderContext,
    parts: PartsManager,

    resource_state: ResourceState,
    reported: Option<ResourceState>,
    lease: ResourceLease,

    inbox: mpsc::UnboundedReceiver<LoaderMessage>,
    self_tx: mpsc::UnboundedSender<LoaderMessage>,
    cancel: CancellationToken,
    /// Cancels pending retry timers on tear-down.
    timers: CancellationToken,

    state: LoaderState,
    stop_flag: bool,
    started: bool,
    verifying: bool,
    publishing: Option<JoinHandle<TransferResult<B::Published>>>,

    delay: Option<DelayDispatcherHandle>,
    next_delay: Duration,

    part_map: HashMap<u64, InFlight>,
    check_queries: HashMap<u64, CancellationToken>,
    retry_pending: HashSet<usize>,
    attempts: HashMap<usize, u32>,

    ordered_flag: bool,
    ordered_parts: OrderedEventsProcessor<(Part, QueryResult)>,
    ordered_dispatch: bool,
    ordered_sends: OrderedEventsProcessor<(Part, TransferResult<Vec<u8>>)>,
    next_send_seq: u64,

    total_parts: u64,
    bad_order_parts: u64,
}

impl<B: LoaderBackend> FileLoader<B> {
    fn new(
        backend: B,
        ctx: LoaderContext,
        lease: ResourceLease,
        inbox: mpsc::UnboundedReceiver<LoaderMessage>,
        self_tx: mpsc::UnboundedSender<LoaderMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let parts = PartsManager::new(ctx.config.limits);
        let next_delay = ctx.config.delay.initial;
        let timers = cancel.child_token();
        Self {
            backend,
            ctx,
            parts,
            resource_state: ResourceState::new(),
            reported: None,
            lease,
            inbox,
            self_tx,
            cancel,
            timers,
            state: LoaderState::Initializing,
            stop_flag: false,
            started: false,
            verifying: false,
            publishing: None,
            delay: None,
            next_delay,
            part_map: HashMap::new(),
            check_queries: HashMap::new(),
            retry_pending: HashSet::new(),
            attempts: HashMap::new(),
            ordered_flag: false,
            ordered_parts: OrderedEventsProcessor::new(0),
            ordered_dispatch: false,
            ordered_sends: OrderedEventsProcessor::new(0),
            next_send_seq: 0,
            total_parts: 0,
            bad_order_parts: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        self.start_up();

        while !self.stop_flag {
            let idle = self.backend.idle_deadline();
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.set_state(LoaderState::Cancelled);
                    break;
                }

                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },

                Some(joined) = OptionFuture::from(self.publishing.as_mut()),
                    if self.publishing.is_some() =>
                {
                    self.publishing = None;
                    self.on_published(joined);
                }

                _ = tokio::time::sleep_until(idle.unwrap_or_else(tokio::time::Instant::now)),
                    if idle.is_some() =>
                {
                    self.backend.release_idle_file();
                }
            }
        }

        self.tear_down();
    }

    fn start_up(&mut self) {
        if let Err(error) = self.try_start_up().and_then(|()| self.run_loop()) {
            self.on_error(error);
        }
    }

    fn try_start_up(&mut self) -> TransferResult<()> {
        let info = self.backend.init(self.ctx.config.limits)?;
        self.parts.init(
            info.size,
            info.expected_size,
            info.is_size_final,
            info.part_size,
            &info.ready_parts,
            info.use_part_count_limit,
            info.is_upload,
        )?;
        if info.offset > 0 || info.limit > 0 {
            self.parts.set_streaming_offset(info.offset, info.limit);
        }

        self.resource_state.set_unit_size(self.parts.get_part_size());
        self.ordered_flag = info.ordered_flag;
        if self.ordered_flag {
            let begin = self.parts.get_ready_prefix_count() as u64;
            self.ordered_parts = OrderedEventsProcessor::new(begin);
        }
        self.ordered_dispatch = info.ordered_dispatch;
        if info.need_delay {
            self.delay = Some(DelayDispatcher::spawn(
                Arc::clone(&self.ctx.dispatcher),
                self.ctx.config.delay.floor,
            ));
        }

        debug!(
            kind = self.backend.kind(),
            size = self.parts.get_size_or_zero(),
            part_size = self.parts.get_part_size(),
            part_count = self.parts.get_part_count(),
            ready_size = self.parts.get_ready_size(),
            ordered = self.ordered_flag,
            "loader started"
        );
        self.set_state(LoaderState::Transferring);
        self.on_progress();
        Ok(())
    }

    fn handle(&mut self, message: LoaderMessage) {
        if self.stop_flag || self.publishing.is_some() {
            return;
        }
        let result = match message {
            LoaderMessage::UpdateResources(state) => {
                self.resource_state.update_slave(&state);
                Ok(())
            }
            LoaderMessage::QueryResult { query_id, result } => {
                self.on_query_result(query_id, result)
            }
            LoaderMessage::CheckResult { query_id, result } => {
                self.on_check_result(query_id, result)
            }
            LoaderMessage::PartPrepared { seq, part, result } => {
                self.on_part_prepared(seq, part, result)
            }
            LoaderMessage::PartWritten { part, result } => {
                result.and_then(|size| self.on_part_applied(part, size))
            }
            LoaderMessage::Verified(result) => self.on_verified(result),
            LoaderMessage::RetryPart { part_id } => {
                if self.retry_pending.remove(&part_id) {
                    self.parts.on_part_failed(part_id);
                }
                Ok(())
            }
            LoaderMessage::UpdatePriority(priority) => {
                self.lease.update_priority(priority);
                return;
            }
            LoaderMessage::UpdateLocalLocation(location) => {
                self.on_update_local_location(location)
            }
            LoaderMessage::UpdateDownloadedPart { offset, limit } => {
                self.on_update_downloaded_part(offset, limit);
                Ok(())
            }
        };
        if let Err(error) = result.and_then(|()| self.run_loop()) {
            self.on_error(error);
        }
    }

    // -------------------------------------------------------------------------
    // Part loop
    // -------------------------------------------------------------------------

    fn run_loop(&mut self) -> TransferResult<()> {
        if self.stop_flag || self.publishing.is_some() {
            return Ok(());
        }

        if !self.verifying {
            let ready_prefix_size = self.parts.get_unchecked_ready_prefix_size();
            let check = self.backend.check_loop(
                self.parts.get_checked_prefix_size(),
                ready_prefix_size,
                self.parts.unchecked_ready(),
            )?;
            if check.need_check {
                if !self.parts.need_check() {
                    self.parts.set_need_check();
                }
                self.parts.set_checked_prefix_size(check.checked_prefix_size);
            }
            for query in check.queries {
                self.send_check_query(query);
            }
            if let Some(job) = check.verify {
                self.verifying = true;
                self.spawn_job(job, LoaderMessage::Verified);
            }
        }

        if self.parts.may_finish() {
            return self.finish();
        }

        let mut awaiting_budget = false;
        loop {
            if self.resource_state.unused() < self.parts.get_part_size() {
                awaiting_budget = true;
                break;
            }
            let Some(part) = self.parts.start_part()? else {
                break;
            };
            if !self.started {
                self.started = true;
                self.backend.on_start();
            }
            self.resource_state.start_use(part.size);
            trace!(part = part.id, offset = part.offset, size = part.size, "part started");

            match self.backend.start_part(part, &self.parts)? {
                PartStart::Query(query) => self.send_part_query(part, query),
                PartStart::Prepare(job) => self.prepare_part(part, job),
            }
        }

        self.set_state(if awaiting_budget {
            LoaderState::AwaitingBudget
        } else {
            LoaderState::Transferring
        });
        self.update_estimated_limit();
        Ok(())
    }

    fn send_part_query(&mut self, part: Part, query: Query) {
        let query_id = query.id;
        self.part_map.insert(
            query_id,
            InFlight {
                part,
                cancel: query.cancel.clone(),
            },
        );
        let tx = self.self_tx.clone();
        let callback = Box::new(move |result| {
            let _ = tx.send(LoaderMessage::QueryResult { query_id, result });
        });
        match &self.delay {
            Some(delay) => {
                delay.send_with_callback_and_delay(query, callback, self.next_delay);
                self.next_delay = self.ctx.config.delay.next(self.next_delay);
            }
            None => self.ctx.dispatcher.dispatch(query, callback),
        }
    }

    fn send_check_query(&mut self, query: Query) {
        let query_id = query.id;
        self.check_queries.insert(query_id, query.cancel.clone());
        let tx = self.self_tx.clone();
        self.ctx.dispatcher.dispatch(
            query,
            Box::new(move |result| {
                let _ = tx.send(LoaderMessage::CheckResult { query_id, result });
            }),
        );
    }

    fn prepare_part(&mut self, part: Part, job: PrepareJob) {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        self.spawn_job(job, move |result| LoaderMessage::PartPrepared { seq, part, result });
    }

    /// Runs `job` on the blocking pool and posts its result back.
    fn spawn_job<T, F>(&self, job: BlockingJob<T>, message: F)
    where
        T: Send + 'static,
        F: FnOnce(TransferResult<T>) -> LoaderMessage + Send + 'static,
    {
        let tx = self.self_tx.clone();
        tokio::task::spawn_blocking(move || {
            let _ = tx.send(message(job()));
        });
    }

    fn on_part_prepared(
        &mut self,
        seq: u64,
        part: Part,
        result: TransferResult<Vec<u8>>,
    ) -> TransferResult<()> {
        if !self.ordered_dispatch {
            return self.send_prepared(part, result);
        }
        let mut ready = Vec::new();
        self.ordered_sends
            .add(seq, (part, result), |_, item| ready.push(item));
        for (part, result) in ready {
            self.send_prepared(part, result)?;
        }
        Ok(())
    }

    fn send_prepared(&mut self, part: Part, result: TransferResult<Vec<u8>>) -> TransferResult<()> {
        let data = result?;
        let query = self.backend.on_part_prepared(part, data, &self.parts)?;
        self.send_part_query(part, query);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    fn on_query_result(&mut self, query_id: u64, result: QueryResult) -> TransferResult<()> {
        let Some(InFlight { part, .. }) = self.part_map.remove(&query_id) else {
            trace!(query_id, "result for unknown query ignored");
            return Ok(());
        };

        let restart = matches!(result, Err(TransportError::Canceled))
            || self.backend.should_restart_part(part, &result)?;
        if restart {
            trace!(part = part.id, "part restarted");
            self.resource_state.stop_use(part.size);
            self.parts.on_part_failed(part.id);
            return Ok(());
        }

        if let Err(error) = &result {
            if error.is_transient() {
                self.resource_state.stop_use(part.size);
                return self.schedule_retry(part, error.clone());
            }
        }

        if !self.ordered_flag {
            return self.apply_part(part, result);
        }
        let mut ready = Vec::new();
        self.ordered_parts
            .add(part.id as u64, (part, result), |_, item| ready.push(item));
        for (part, result) in ready {
            self.apply_part(part, result)?;
        }
        Ok(())
    }

    fn apply_part(&mut self, part: Part, result: QueryResult) -> TransferResult<()> {
        match self.backend.process_part(part, result, &self.parts)? {
            PartApply::Done(size) => self.on_part_applied(part, size),
            PartApply::Write(job) => {
                self.spawn_job(job, move |result| LoaderMessage::PartWritten { part, result });
                Ok(())
            }
        }
    }

    fn on_part_applied(&mut self, part: Part, size: i64) -> TransferResult<()> {
        self.resource_state.stop_use(part.size);

        let old_prefix = self.parts.get_ready_prefix_count();
        self.parts.on_part_ok(part.id, part.size, size)?;
        self.attempts.remove(&part.id);
        self.total_parts += 1;
        if self.parts.get_ready_prefix_count() == old_prefix {
            self.bad_order_parts += 1;
        }
        trace!(part = part.id, size, "part ready");

        self.on_progress();
        Ok(())
    }

    fn schedule_retry(&mut self, part: Part, error: TransportError) -> TransferResult<()> {
        let attempt = {
            let attempts = self.attempts.entry(part.id).or_insert(0);
            *attempts += 1;
            *attempts
        };
        let Some(delay) = self.ctx.config.retry.delay_for_attempt(attempt) else {
            return Err(TransferError::RetriesExhausted {
                part: part.id,
                attempts: attempt,
                source: error,
            });
        };

        warn!(
            kind = self.backend.kind(),
            part = part.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "part failed, retrying"
        );
        self.retry_pending.insert(part.id);
        let tx = self.self_tx.clone();
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(LoaderMessage::RetryPart { part_id: part.id });
                }
            }
        });
        Ok(())
    }

    fn on_verified(&mut self, result: TransferResult<i64>) -> TransferResult<()> {
        self.verifying = false;
        let checked_prefix_size = result?;
        trace!(checked_prefix_size, "prefix verified");
        self.parts.set_checked_prefix_size(checked_prefix_size);
        self.on_progress();
        Ok(())
    }

    fn on_check_result(&mut self, query_id: u64, result: QueryResult) -> TransferResult<()> {
        if self.check_queries.remove(&query_id).is_none() {
            return Ok(());
        }
        self.backend.process_check_query(result)
    }

    // -------------------------------------------------------------------------
    // External updates
    // -------------------------------------------------------------------------

    fn on_update_local_location(&mut self, location: LocalLocation) -> TransferResult<()> {
        if let Some(prefix) = self.backend.on_update_local_location(&location)? {
            self.parts.set_known_prefix(prefix.size, prefix.is_ready)?;
        }
        Ok(())
    }

    /// Moves the streaming window, cancelling requests that fall outside it.
    fn on_update_downloaded_part(&mut self, offset: i64, limit: i64) {
        if self.ordered_flag {
            debug!(offset, limit, "ordered loader keeps its window");
            return;
        }
        if self.parts.get_streaming_offset() == offset {
            self.parts.set_streaming_limit(limit);
            return;
        }

        let begin = self.parts.set_streaming_offset(offset, limit);
        let part_size = self.parts.get_part_size();
        let new_end = if limit <= 0 {
            self.parts.get_part_count()
        } else {
            ((offset + limit - 1) / part_size) as usize + 1
        };
        let max_parts = (self.ctx.config.download.resource_limit / part_size).max(1) as usize;
        let end = begin + max_parts.min(new_end.saturating_sub(begin));

        let mut cancelled = 0;
        for in_flight in self.part_map.values() {
            if in_flight.part.id < begin || in_flight.part.id >= end {
                in_flight.cancel.cancel();
                cancelled += 1;
            }
        }
        debug!(offset, limit, begin, end, cancelled, "streaming window moved");
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    fn finish(&mut self) -> TransferResult<()> {
        self.set_state(LoaderState::Finalizing);
        self.parts.finish()?;
        let job = self.backend.publish(&self.parts)?;
        self.publishing = Some(tokio::task::spawn_blocking(job));
        Ok(())
    }

    fn on_published(&mut self, joined: Result<TransferResult<B::Published>, JoinError>) {
        let result = joined
            .map_err(|e| TransferError::Internal(format!("publish job failed: {e}")))
            .and_then(|published| published)
            .and_then(|published| self.backend.on_ok(published, &self.parts));
        if let Err(error) = result {
            self.on_error(error);
            return;
        }
        self.stop_flag = true;
        self.set_state(LoaderState::Completed);
        debug!(
            kind = self.backend.kind(),
            size = self.parts.get_size_or_zero(),
            parts = self.total_parts,
            out_of_order = self.bad_order_parts,
            "transfer complete"
        );
    }

    fn on_error(&mut self, error: TransferError) {
        if self.stop_flag {
            return;
        }
        self.stop_flag = true;
        self.set_state(LoaderState::Failed);
        warn!(kind = self.backend.kind(), error = %error, "transfer failed");
        self.backend.on_error(error);
    }

    fn on_progress(&mut self) {
        let progress = Progress {
            part_count: self.parts.get_part_count(),
            part_size: self.parts.get_part_size(),
            ready_part_count: self.parts.get_ready_prefix_count(),
            ready_bitmask: self.parts.get_bitmask(),
            is_ready: self.parts.ready(),
            ready_size: self.parts.get_ready_size(),
            size: self.parts.get_size_or_zero(),
        };
        self.backend.on_progress(progress);
    }

    fn update_estimated_limit(&mut self) {
        if self.stop_flag {
            return;
        }
        let extra = self.parts.get_estimated_extra();
        self.resource_state.update_estimated_limit(extra);
        if self.reported != Some(self.resource_state) {
            self.reported = Some(self.resource_state);
            self.lease.update_resources(self.resource_state);
        }
    }

    fn set_state(&mut self, state: LoaderState) {
        if self.state != state {
            debug!(kind = self.backend.kind(), from = ?self.state, to = ?state, "loader state");
            self.state = state;
        }
    }

    fn tear_down(&mut self) {
        for (_, in_flight) in self.part_map.drain() {
            in_flight.cancel.cancel();
        }
        for (_, cancel) in self.check_queries.drain() {
            cancel.cancel();
        }
        self.ordered_parts.clear(|_| {});
        self.ordered_sends.clear(|_| {});
        self.timers.cancel();
        if let Some(delay) = self.delay.take() {
            delay.close_silent();
        }
        self.backend.close();
        debug!(kind = self.backend.kind(), state = ?self.state, "loader stopped");
    }
}
