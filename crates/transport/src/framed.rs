//! Packet channel over any async byte stream (pipes, sockets, stdio)

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use treesync_core::{Packet, Result, SyncError};

use crate::{PacketReceiver, PacketSender};

/// Frames packets as `type | length | payload`
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        Packet::decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(SyncError::protocol("connection closed mid-frame")),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = SyncError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        packet.encode(dst)
    }
}

/// Reads framed packets from a byte stream
pub struct FramedReader<R> {
    inner: FramedRead<R, PacketCodec>,
}

impl<R: AsyncRead> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: FramedRead::new(inner, PacketCodec),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PacketReceiver for FramedReader<R> {
    async fn recv(&mut self) -> Result<Option<Packet>> {
        // StreamExt::next is cancel safe; partial frames stay in the read buffer
        self.inner.next().await.transpose()
    }
}

/// Writes framed packets to a byte stream
pub struct FramedWriter<W> {
    inner: FramedWrite<W, PacketCodec>,
}

impl<W: AsyncWrite> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: FramedWrite::new(inner, PacketCodec),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PacketSender for FramedWriter<W> {
    async fn send(&mut self, packet: Packet) -> Result<()> {
        // SinkExt::send flushes, so every packet reaches the peer before returning
        SinkExt::send(&mut self.inner, packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use treesync_core::{FileInfo, Stat};

    #[tokio::test]
    async fn test_packets_survive_small_pipe() {
        // Tiny buffer forces frames to be split across reads
        let (a, b) = tokio::io::duplex(7);
        let mut writer = FramedWriter::new(a);
        let mut reader = FramedReader::new(b);

        let packets = vec![
            Packet::Stat(Stat::new("dir", FileInfo::Directory { mode: 0o755 })),
            Packet::DataRequest(PathBuf::from("dir/file")),
            Packet::Data {
                path: PathBuf::from("dir/file"),
                chunk: Bytes::from(vec![7u8; 1000]),
            },
            Packet::Fin,
        ];

        let expected = packets.clone();
        let write = tokio::spawn(async move {
            for packet in packets {
                writer.send(packet).await.unwrap();
            }
        });

        for packet in expected {
            assert_eq!(reader.recv().await.unwrap(), Some(packet));
        }
        write.await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut frame = BytesMut::new();
        Packet::Error("bye".into()).encode(&mut frame).unwrap();
        a.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(a);

        let mut reader = FramedReader::new(b);
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn test_codec_decodes_back_to_back_frames() {
        let mut codec = PacketCodec;
        let mut buffer = BytesMut::new();
        codec
            .encode(Packet::DataRequest(PathBuf::from("a")), &mut buffer)
            .unwrap();
        codec.encode(Packet::Fin, &mut buffer).unwrap();

        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Packet::DataRequest(PathBuf::from("a")))
        );
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Packet::Fin));
        assert_eq!(codec.decode_eof(&mut buffer).unwrap(), None);
    }
}
