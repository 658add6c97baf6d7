//! treesync-transport: sync rounds over packet channels
//!
//! A round runs a [`send::Sender`] on one end of a bidirectional packet
//! channel and a [`receive::Receiver`] on the other. Channels can be any
//! byte stream ([`framed`]) or an in-process queue ([`memory`]).

pub mod framed;
pub mod local;
pub mod memory;
pub mod receive;
pub mod send;

use async_trait::async_trait;
use treesync_core::{Packet, Result};

pub use framed::{FramedReader, FramedWriter, PacketCodec};
pub use local::copy_tree;
pub use memory::{MemoryReceiver, MemorySender, channel_pair};
pub use receive::{Receiver, RoundSummary};
pub use send::{SendSummary, Sender};

/// Outgoing half of a packet channel
#[async_trait]
pub trait PacketSender: Send {
    /// Send one packet.
    ///
    /// # Errors
    /// Returns a transport error if the channel is broken
    async fn send(&mut self, packet: Packet) -> Result<()>;
}

/// Incoming half of a packet channel
#[async_trait]
pub trait PacketReceiver: Send {
    /// Receive the next packet, or `None` once the peer closed the channel.
    ///
    /// Implementations must be cancel safe: dropping the future before it
    /// completes loses no packet.
    ///
    /// # Errors
    /// Returns an error for malformed packets or a broken channel
    async fn recv(&mut self) -> Result<Option<Packet>>;
}
