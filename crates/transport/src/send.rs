//! Sending side of a sync round
//!
//! The source tree is walked on a blocking thread while the round loop
//! streams `Stat` packets, ends the listing with `Fin`, and serves
//! `DataRequest`s until the peer sends its own `Fin`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use treesync_core::config::DEFAULT_CHUNK_SIZE;
use treesync_core::protocol::MAX_CHUNK_SIZE;
use treesync_core::stat::validate_relative;
use treesync_core::{Packet, Result, Stat, SyncError, Walker};

use crate::{PacketReceiver, PacketSender};

/// Stats buffered between the walk thread and the round loop
const STAT_QUEUE: usize = 256;

/// Statistics of a completed send round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    /// Stat packets sent
    pub entries: usize,
    /// Files whose content was requested and served
    pub files_served: usize,
    /// Content bytes sent
    pub bytes_sent: u64,
}

/// Streams a source tree to a peer
#[derive(Debug, Clone)]
pub struct Sender {
    walker: Walker,
    chunk_size: usize,
}

impl Sender {
    pub fn new(walker: Walker) -> Self {
        Self {
            walker,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Run one round.
    ///
    /// On a local failure an `Error` packet is sent to the peer before the
    /// error is returned.
    ///
    /// # Errors
    /// Returns walk, transfer, protocol and transport errors, errors reported
    /// by the peer, or [`SyncError::Cancelled`]
    pub async fn send<T, R>(
        &self,
        tx: &mut T,
        rx: &mut R,
        cancel: &CancellationToken,
    ) -> Result<SendSummary>
    where
        T: PacketSender + ?Sized,
        R: PacketReceiver + ?Sized,
    {
        let result = self.run(tx, rx, cancel).await;
        match &result {
            Ok(summary) => info!(
                "Sent {} entries, served {} files ({} bytes)",
                summary.entries, summary.files_served, summary.bytes_sent
            ),
            Err(err @ (SyncError::Remote(_) | SyncError::Transport(_))) => {
                debug!("Send round aborted: {err}");
            }
            Err(err) => {
                if let Err(send_err) = tx.send(Packet::Error(err.to_string())).await {
                    debug!("Failed to report error to peer: {send_err}");
                }
            }
        }
        result
    }

    async fn run<T, R>(
        &self,
        tx: &mut T,
        rx: &mut R,
        cancel: &CancellationToken,
    ) -> Result<SendSummary>
    where
        T: PacketSender + ?Sized,
        R: PacketReceiver + ?Sized,
    {
        let walk_cancel = cancel.child_token();
        let _stop_walk = walk_cancel.clone().drop_guard();

        let (stat_tx, mut stat_rx) = mpsc::channel::<Stat>(STAT_QUEUE);
        let walker = self.walker.clone();
        let mut walk = tokio::task::spawn_blocking(move || {
            walker.walk(&walk_cancel, |stat| {
                stat_tx.blocking_send(stat).map_err(|_| SyncError::Cancelled)
            })
        });

        let mut summary = SendSummary::default();
        let mut announced: HashSet<PathBuf> = HashSet::new();
        let mut walking = true;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(SyncError::Cancelled),

                stat = stat_rx.recv(), if walking => match stat {
                    Some(stat) => {
                        if stat.info.is_file() {
                            announced.insert(stat.path.clone());
                        }
                        tx.send(Packet::Stat(stat)).await?;
                        summary.entries += 1;
                    }
                    None => {
                        walking = false;
                        (&mut walk).await??;
                        tx.send(Packet::Fin).await?;
                        debug!("Listing complete: {} entries", summary.entries);
                    }
                },

                packet = rx.recv() => match packet? {
                    Some(Packet::DataRequest(path)) => {
                        if !announced.contains(&path) {
                            return Err(SyncError::protocol(format!(
                                "content requested for unannounced path {}",
                                path.display()
                            )));
                        }
                        let sent = self.serve(tx, &path).await?;
                        summary.files_served += 1;
                        summary.bytes_sent += sent;
                    }
                    Some(Packet::Fin) if !walking => return Ok(summary),
                    Some(Packet::Fin) => {
                        return Err(SyncError::protocol(
                            "peer finished before the listing was complete",
                        ));
                    }
                    Some(Packet::Error(message)) => return Err(SyncError::Remote(message)),
                    Some(other) => {
                        return Err(SyncError::protocol(format!(
                            "unexpected packet type {} from receiver",
                            other.msg_type()
                        )));
                    }
                    // Closing after our Fin ends the round
                    None if !walking => return Ok(summary),
                    None => return Err(SyncError::protocol("peer closed the channel mid-round")),
                },
            }
        }
    }

    /// Stream one file as Data packets followed by an empty chunk.
    async fn serve<T>(&self, tx: &mut T, path: &Path) -> Result<u64>
    where
        T: PacketSender + ?Sized,
    {
        validate_relative(path)?;
        let transfer = |e: std::io::Error| SyncError::Transfer {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        let mut file = tokio::fs::File::open(self.walker.root().join(path))
            .await
            .map_err(transfer)?;
        let mut total = 0u64;
        loop {
            let mut chunk = BytesMut::zeroed(self.chunk_size);
            let read = file.read(&mut chunk).await.map_err(transfer)?;
            if read == 0 {
                break;
            }
            chunk.truncate(read);
            total += read as u64;
            tx.send(Packet::Data {
                path: path.to_path_buf(),
                chunk: chunk.freeze(),
            })
            .await?;
        }

        tx.send(Packet::Data {
            path: path.to_path_buf(),
            chunk: Bytes::new(),
        })
        .await?;
        trace!("Served {} ({total} bytes)", path.display());
        Ok(total)
    }
}
