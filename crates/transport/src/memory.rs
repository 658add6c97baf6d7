//! In-process packet channel

use async_trait::async_trait;
use tokio::sync::mpsc;
use treesync_core::{Packet, Result, SyncError};

use crate::{PacketReceiver, PacketSender};

/// Sending half of an in-process channel
pub struct MemorySender {
    inner: mpsc::Sender<Packet>,
}

/// Receiving half of an in-process channel
pub struct MemoryReceiver {
    inner: mpsc::Receiver<Packet>,
}

/// Two connected endpoints; each is a (sender, receiver) pair talking to the other.
#[must_use]
pub fn channel_pair(
    capacity: usize,
) -> ((MemorySender, MemoryReceiver), (MemorySender, MemoryReceiver)) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        (MemorySender { inner: a_tx }, MemoryReceiver { inner: b_rx }),
        (MemorySender { inner: b_tx }, MemoryReceiver { inner: a_rx }),
    )
}

#[async_trait]
impl PacketSender for MemorySender {
    async fn send(&mut self, packet: Packet) -> Result<()> {
        self.inner.send(packet).await.map_err(|_| {
            SyncError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer endpoint dropped",
            ))
        })
    }
}

#[async_trait]
impl PacketReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<Packet>> {
        Ok(self.inner.recv().await)
    }
}
