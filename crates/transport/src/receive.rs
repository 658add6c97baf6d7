//! Receiving side of a sync round
//!
//! The peer's listing is accumulated until `Fin`, diffed against the last
//! committed snapshot, and applied through a [`DiskWriter`]. File content is
//! requested lazily as the writer reaches each file, and streamed straight
//! into the file as `Data` packets arrive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use treesync_core::config::DEFAULT_CONCURRENCY;
use treesync_core::stat::validate_relative;
use treesync_core::{
    Change, ChangeKind, ChangeObserver, ContentIdentity, ContentMode, ContentSink, ContentSource,
    DiskWriter, FileInfo, Packet, Result, Snapshot, SnapshotBuilder, SyncError,
};

use crate::{PacketReceiver, PacketSender};

/// Content requests buffered between the writer and the round loop
const REQUEST_QUEUE: usize = 64;

/// Data chunks buffered per file
const DATA_QUEUE: usize = 8;

/// Outcome of a successful round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Changes applied this round, in order
    pub changes: Vec<Change>,
    /// Files whose content was fetched from the peer
    pub requested: Vec<PathBuf>,
}

impl RoundSummary {
    #[must_use]
    pub fn added(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Add)
            .count()
    }

    #[must_use]
    pub fn deleted(&self) -> usize {
        self.changes.len() - self.added()
    }
}

/// Applies rounds sent by a peer to a destination tree
pub struct Receiver {
    dest: PathBuf,
    snapshot: Snapshot,
    mode: ContentMode,
    observer: Option<Arc<dyn ChangeObserver>>,
    state_file: Option<PathBuf>,
}

impl Receiver {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            snapshot: Snapshot::empty(),
            mode: ContentMode::Async {
                max_in_flight: DEFAULT_CONCURRENCY,
            },
            observer: None,
            state_file: None,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ContentMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ChangeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Persist the committed snapshot at `path`, resuming from it if present.
    ///
    /// # Errors
    /// Returns an error if an existing state file cannot be loaded
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        self.snapshot = Snapshot::load(&path)?;
        debug!(
            "Resuming from {} ({} entries)",
            path.display(),
            self.snapshot.len()
        );
        self.state_file = Some(path);
        Ok(self)
    }

    /// Last committed snapshot
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Run one round.
    ///
    /// The stored snapshot is replaced only after every change was applied
    /// and the round was acknowledged with `Fin`. On a local failure an
    /// `Error` packet is sent to the peer before the error is returned.
    ///
    /// # Errors
    /// Returns apply, transfer, protocol and transport errors, errors
    /// reported by the peer, or [`SyncError::Cancelled`]
    pub async fn receive<T, R>(
        &mut self,
        tx: &mut T,
        rx: &mut R,
        cancel: &CancellationToken,
    ) -> Result<RoundSummary>
    where
        T: PacketSender + ?Sized,
        R: PacketReceiver + ?Sized,
    {
        let result = self
            .run(tx, rx, cancel)
            .await
            .and_then(|round| self.persist(&round.0).map(|()| round));
        let (incoming, summary) = match result {
            Ok(round) => round,
            Err(err) => {
                if !matches!(err, SyncError::Remote(_) | SyncError::Transport(_)) {
                    if let Err(send_err) = tx.send(Packet::Error(err.to_string())).await {
                        debug!("Failed to report error to peer: {send_err}");
                    }
                }
                warn!("Round failed in {} phase: {err}", err.phase());
                return Err(err);
            }
        };

        // Acknowledge only once the new state is durable
        tx.send(Packet::Fin).await?;
        self.snapshot = incoming;

        info!(
            "Applied {} additions and {} deletions, fetched {} files",
            summary.added(),
            summary.deleted(),
            summary.requested.len()
        );
        Ok(summary)
    }

    fn persist(&self, incoming: &Snapshot) -> Result<()> {
        match &self.state_file {
            Some(state_file) => incoming.save(state_file),
            None => Ok(()),
        }
    }

    async fn run<T, R>(
        &self,
        tx: &mut T,
        rx: &mut R,
        cancel: &CancellationToken,
    ) -> Result<(Snapshot, RoundSummary)>
    where
        T: PacketSender + ?Sized,
        R: PacketReceiver + ?Sized,
    {
        let incoming = read_listing(rx, cancel).await?;
        let changes: Vec<Change> = self.snapshot.diff(&incoming).collect();
        debug!(
            "Listing of {} entries, {} changes against previous snapshot",
            incoming.len(),
            changes.len()
        );

        tokio::fs::create_dir_all(&self.dest)
            .await
            .map_err(|e| SyncError::apply("create directory", &self.dest, e))?;

        let (request_tx, mut request_rx) = mpsc::channel(REQUEST_QUEUE);
        let inflight: Inflight = Arc::default();
        let source = RemoteSource {
            requests: request_tx,
            inflight: Arc::clone(&inflight),
        };

        let mut writer = DiskWriter::new(&self.dest, Arc::new(source))
            .with_mode(self.mode)
            .with_cancellation(cancel.clone());
        if let Some(observer) = &self.observer {
            writer = writer.with_observer(Arc::clone(observer));
        }

        let to_apply = changes.clone();
        let mut apply = tokio::spawn(async move {
            for change in to_apply {
                writer.handle_change(change).await?;
            }
            writer.wait().await
        });

        let exchanged = exchange(tx, rx, &mut apply, &mut request_rx, &inflight, cancel).await;
        if exchanged.is_err() {
            apply.abort();
        }

        Ok((
            incoming,
            RoundSummary {
                changes,
                requested: exchanged?,
            },
        ))
    }
}

/// Per-file data channels of outstanding requests
type Inflight = Arc<Mutex<HashMap<PathBuf, mpsc::Sender<Bytes>>>>;

/// Accumulate Stat packets until the peer's Fin.
async fn read_listing<R>(rx: &mut R, cancel: &CancellationToken) -> Result<Snapshot>
where
    R: PacketReceiver + ?Sized,
{
    let mut builder = SnapshotBuilder::default();
    loop {
        let packet = tokio::select! {
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
            packet = rx.recv() => packet?,
        };
        match packet {
            Some(Packet::Stat(stat)) => {
                validate_relative(&stat.path)?;
                if let FileInfo::File {
                    identity: ContentIdentity::HardLink(first),
                    ..
                } = &stat.info
                {
                    validate_relative(first)?;
                }
                builder.push(stat)?;
            }
            Some(Packet::Fin) => return Ok(builder.finish()),
            Some(Packet::Error(message)) => return Err(SyncError::Remote(message)),
            Some(other) => {
                return Err(SyncError::protocol(format!(
                    "unexpected packet type {} while reading listing",
                    other.msg_type()
                )));
            }
            None => {
                return Err(SyncError::protocol(format!(
                    "peer closed the channel after {} entries",
                    builder.len()
                )));
            }
        }
    }
}

/// Forward content requests and route content until the writer finishes.
async fn exchange<T, R>(
    tx: &mut T,
    rx: &mut R,
    apply: &mut tokio::task::JoinHandle<Result<()>>,
    request_rx: &mut mpsc::Receiver<PathBuf>,
    inflight: &Inflight,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>>
where
    T: PacketSender + ?Sized,
    R: PacketReceiver + ?Sized,
{
    let mut requested = Vec::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(SyncError::Cancelled),

            applied = &mut *apply => {
                applied??;
                return Ok(requested);
            }

            Some(path) = request_rx.recv() => {
                trace!("Requesting {}", path.display());
                tx.send(Packet::DataRequest(path.clone())).await?;
                requested.push(path);
            }

            packet = rx.recv() => match packet? {
                Some(Packet::Data { path, chunk }) => route_chunk(inflight, path, chunk).await?,
                Some(Packet::Error(message)) => return Err(SyncError::Remote(message)),
                Some(other) => {
                    return Err(SyncError::protocol(format!(
                        "unexpected packet type {} while applying changes",
                        other.msg_type()
                    )));
                }
                None => return Err(SyncError::protocol("peer closed the channel mid-round")),
            },
        }
    }
}

async fn route_chunk(inflight: &Inflight, path: PathBuf, chunk: Bytes) -> Result<()> {
    let end_of_file = chunk.is_empty();
    let target = {
        let mut map = inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if end_of_file {
            map.remove(&path)
        } else {
            map.get(&path).cloned()
        }
    };

    let Some(target) = target else {
        return Err(SyncError::protocol(format!(
            "data for {} which was not requested",
            path.display()
        )));
    };
    if target.send(chunk).await.is_err() {
        // The retrieval already failed; its error surfaces from the writer
        debug!("Dropping data for abandoned transfer of {}", path.display());
    }
    Ok(())
}

/// Content source that fetches files from the peer on demand
struct RemoteSource {
    requests: mpsc::Sender<PathBuf>,
    inflight: Inflight,
}

#[async_trait]
impl ContentSource for RemoteSource {
    async fn write_content(&self, path: &Path, sink: &mut ContentSink) -> Result<()> {
        let (data_tx, mut data_rx) = mpsc::channel(DATA_QUEUE);
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), data_tx);

        let interrupted = |message: &str| SyncError::Transfer {
            path: path.to_path_buf(),
            message: message.to_string(),
        };

        self.requests
            .send(path.to_path_buf())
            .await
            .map_err(|_| interrupted("round ended before the request was sent"))?;

        while let Some(chunk) = data_rx.recv().await {
            if chunk.is_empty() {
                trace!("Received {} ({} bytes)", path.display(), sink.written());
                return Ok(());
            }
            sink.write_chunk(&chunk)
                .await
                .map_err(|e| SyncError::apply("write", path, e))?;
        }
        Err(interrupted("content stream ended before end of file"))
    }
}
