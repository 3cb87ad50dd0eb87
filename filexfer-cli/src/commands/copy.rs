//! Loopback copy: upload a file into the in-memory transport, then download
//! it back and publish it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use filexfer::net::MemoryTransport;
use filexfer::{
    DownloadParams, FileProgressStore, FileType, FullLocalLocation, LocalLocation,
    PartialRemoteLocation, Progress, QueryId, TransferCallback, TransferConfig, TransferContext,
    TransferError, TransferManager, UploadParams,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::CliError;

const UPLOAD_QUERY: QueryId = 1;
const DOWNLOAD_QUERY: QueryId = 2;

#[derive(Debug, Args)]
pub struct CopyArgs {
    /// File to copy
    pub source: PathBuf,

    /// Directory the copy is published into
    pub destination: PathBuf,

    /// Persist partial progress in this directory
    #[arg(long)]
    pub progress_dir: Option<PathBuf>,

    /// Simulated per-request latency in milliseconds
    #[arg(long, default_value_t = 0)]
    pub latency_ms: u64,

    /// Transfer priority
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i8,
}

enum Event {
    Progress(Progress),
    Uploaded(PartialRemoteLocation, i64),
    Downloaded(FullLocalLocation, i64),
    Failed(TransferError),
}

struct ChannelCallback {
    tx: mpsc::UnboundedSender<(QueryId, Event)>,
}

impl ChannelCallback {
    fn send(&self, query_id: QueryId, event: Event) {
        let _ = self.tx.send((query_id, event));
    }
}

impl TransferCallback for ChannelCallback {
    fn on_progress(&self, query_id: QueryId, progress: &Progress) {
        self.send(query_id, Event::Progress(progress.clone()));
    }

    fn on_download_ok(&self, query_id: QueryId, location: FullLocalLocation, size: i64, _is_new: bool) {
        self.send(query_id, Event::Downloaded(location, size));
    }

    fn on_upload_ok(
        &self,
        query_id: QueryId,
        _file_type: FileType,
        partial: PartialRemoteLocation,
        size: i64,
    ) {
        self.send(query_id, Event::Uploaded(partial, size));
    }

    fn on_error(&self, query_id: QueryId, error: TransferError) {
        self.send(query_id, Event::Failed(error));
    }
}

pub async fn run(mut config: TransferConfig, args: CopyArgs) -> Result<(), CliError> {
    let metadata = std::fs::metadata(&args.source)
        .map_err(|e| CliError::io(format!("cannot read {}", args.source.display()), e))?;
    if !metadata.is_file() {
        return Err(CliError::Usage(format!(
            "{} is not a regular file",
            args.source.display()
        )));
    }
    config = config.with_files_dir(&args.destination);

    let transport =
        MemoryTransport::new().with_latency(Duration::from_millis(args.latency_ms));
    let mut ctx = TransferContext::new(config, Arc::new(transport.clone()));
    let store = match &args.progress_dir {
        Some(dir) => {
            let store = FileProgressStore::open(dir)
                .map_err(|e| CliError::io(format!("cannot open {}", dir.display()), e))?;
            Some(Arc::new(store))
        }
        None => None,
    };
    if let Some(store) = &store {
        ctx = ctx.with_store(store.clone());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = TransferManager::start(ctx, Arc::new(ChannelCallback { tx }));
    let result = copy(&manager, &transport, &mut rx, &args).await;
    manager.close().await;
    if let Some(store) = store {
        store.flush().await;
    }

    let (location, size) = result?;
    println!("Copied {size} bytes to {}", location.path.display());
    Ok(())
}

async fn copy(
    manager: &TransferManager,
    transport: &MemoryTransport,
    rx: &mut mpsc::UnboundedReceiver<(QueryId, Event)>,
    args: &CopyArgs,
) -> Result<(FullLocalLocation, i64), CliError> {
    let local = LocalLocation::Full(FullLocalLocation {
        file_type: FileType::Document,
        path: args.source.clone(),
        mtime_nsec: 0,
    });
    manager.upload(
        UPLOAD_QUERY,
        UploadParams::new(FileType::Document, local).with_priority(args.priority),
    );
    let (partial, size) = match wait(manager, rx, UPLOAD_QUERY, &progress_bar("Uploading")).await? {
        Event::Uploaded(partial, size) => (partial, size),
        _ => return Err(CliError::Usage("unexpected upload outcome".into())),
    };
    info!(file_id = partial.file_id, parts = partial.part_count, "upload finished");

    let remote = transport
        .finish_upload(FileType::Document, &partial, size)
        .ok_or_else(|| CliError::Usage("uploaded parts are incomplete".into()))?;
    let name = args
        .source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    manager.download(
        DOWNLOAD_QUERY,
        DownloadParams::new(remote, size)
            .with_name(name)
            .with_priority(args.priority),
    );
    match wait(manager, rx, DOWNLOAD_QUERY, &progress_bar("Downloading")).await? {
        Event::Downloaded(location, size) => Ok((location, size)),
        _ => Err(CliError::Usage("unexpected download outcome".into())),
    }
}

/// Follows one query to its outcome, cancelling it on Ctrl+C.
async fn wait(
    manager: &TransferManager,
    rx: &mut mpsc::UnboundedReceiver<(QueryId, Event)>,
    query_id: QueryId,
    bar: &ProgressBar,
) -> Result<Event, CliError> {
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                bar.abandon_with_message("interrupted");
                manager.cancel(query_id);
                return Err(CliError::Interrupted);
            }
            event = rx.recv() => match event {
                None => return Err(CliError::Transfer(TransferError::Aborted)),
                Some((id, _)) if id != query_id => {}
                Some((_, Event::Progress(progress))) => {
                    if progress.size > 0 {
                        bar.set_length(progress.size as u64);
                    }
                    bar.set_position(progress.ready_size.max(0) as u64);
                }
                Some((_, Event::Failed(error))) => {
                    bar.abandon_with_message("failed");
                    return Err(error.into());
                }
                Some((_, event)) => {
                    bar.finish_with_message("done");
                    return Ok(event);
                }
            },
        }
    }
}

fn progress_bar(message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{msg:12} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )
    .map(|style| style.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message(message);
    bar
}
