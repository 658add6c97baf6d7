//! Binary packet codec for tree sync rounds
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Packet types:
//! - 0x00: Stat (path, kind:1, mode:4, kind-specific tail)
//! - 0x01: DataRequest (path)
//! - 0x02: Data (path, raw chunk; an empty chunk ends the file)
//! - 0x03: Fin (no payload)
//! - 0x04: Error (UTF-8 message)
//!
//! Paths are encoded as `len:2, bytes`. The Stat tail is empty for
//! directories, `target` (path encoding) for symlinks, and
//! `size:8, modified:8, identity` for regular files, where identity is
//! `0, dev:8, ino:8` or `1, path` for a hard link to an earlier entry.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SyncError};
use crate::stat::{ContentIdentity, FileInfo, Stat};

/// Frame header: type byte plus payload length
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single frame's payload
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest Data chunk that fits a frame next to the longest encodable path
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - 2 - u16::MAX as usize;

/// Packet type identifiers
pub mod msg {
    pub const STAT: u8 = 0x00;
    pub const DATA_REQUEST: u8 = 0x01;
    pub const DATA: u8 = 0x02;
    pub const FIN: u8 = 0x03;
    pub const ERROR: u8 = 0x04;
}

/// Stat entry kinds
mod kind {
    pub const DIRECTORY: u8 = 0;
    pub const FILE: u8 = 1;
    pub const SYMLINK: u8 = 2;
}

/// Identity tags of regular files
mod identity {
    pub const INODE: u8 = 0;
    pub const HARD_LINK: u8 = 1;
}

/// A single protocol unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// One entry of the sender's listing
    Stat(Stat),
    /// Ask the sender for the content of a regular file
    DataRequest(PathBuf),
    /// A chunk of file content; empty marks end of file
    Data { path: PathBuf, chunk: Bytes },
    /// End of listing (sender) or end of round (receiver)
    Fin,
    /// The peer aborts the round
    Error(String),
}

impl Packet {
    /// Type discriminant written in the frame header
    #[must_use]
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::Stat(_) => msg::STAT,
            Self::DataRequest(_) => msg::DATA_REQUEST,
            Self::Data { .. } => msg::DATA,
            Self::Fin => msg::FIN,
            Self::Error(_) => msg::ERROR,
        }
    }

    /// Append this packet as one frame to `dst`
    ///
    /// # Errors
    /// Returns a protocol error if a path or the whole frame exceeds the wire limits,
    /// or if a removed-marker is sent as a Stat.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::new();
        match self {
            Self::Stat(stat) => encode_stat(stat, &mut payload)?,
            Self::DataRequest(path) => encode_path(path, &mut payload)?,
            Self::Data { path, chunk } => {
                encode_path(path, &mut payload)?;
                payload.extend_from_slice(chunk);
            }
            Self::Fin => {}
            Self::Error(message) => payload.extend_from_slice(message.as_bytes()),
        }

        if payload.len() > MAX_FRAME_SIZE {
            return Err(SyncError::protocol(format!(
                "frame too large: {} bytes",
                payload.len()
            )));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(self.msg_type());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }

    /// Split one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` if `src` does not yet hold a whole frame.
    ///
    /// # Errors
    /// Returns a protocol error for unknown types, oversized or malformed frames.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let msg_type = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(SyncError::protocol(format!("frame too large: {len} bytes")));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        decode_payload(msg_type, payload).map(Some)
    }
}

fn decode_payload(msg_type: u8, payload: Bytes) -> Result<Packet> {
    match msg_type {
        msg::STAT => {
            let mut cursor = Cursor::new(payload.as_ref());
            let stat = decode_stat(&mut cursor).map_err(|e| truncated("stat", &e))?;
            ensure_consumed(&cursor, "stat")?;
            Ok(Packet::Stat(stat))
        }

        msg::DATA_REQUEST => {
            let mut cursor = Cursor::new(payload.as_ref());
            let path = decode_path(&mut cursor).map_err(|e| truncated("data request", &e))?;
            ensure_consumed(&cursor, "data request")?;
            Ok(Packet::DataRequest(path))
        }

        msg::DATA => {
            let mut cursor = Cursor::new(payload.as_ref());
            let path = decode_path(&mut cursor).map_err(|e| truncated("data", &e))?;
            let offset = cursor.position() as usize;
            Ok(Packet::Data {
                path,
                chunk: payload.slice(offset..),
            })
        }

        msg::FIN => {
            if !payload.is_empty() {
                return Err(SyncError::protocol("fin packet carries a payload"));
            }
            Ok(Packet::Fin)
        }

        msg::ERROR => Ok(Packet::Error(String::from_utf8_lossy(&payload).into_owned())),

        other => Err(SyncError::protocol(format!("unknown packet type: {other:#04x}"))),
    }
}

fn truncated(what: &str, err: &std::io::Error) -> SyncError {
    SyncError::protocol(format!("malformed {what} packet: {err}"))
}

fn ensure_consumed(cursor: &Cursor<&[u8]>, what: &str) -> Result<()> {
    if (cursor.position() as usize) < cursor.get_ref().len() {
        return Err(SyncError::protocol(format!(
            "trailing bytes in {what} packet"
        )));
    }
    Ok(())
}

/// Encode a path as length-prefixed bytes
fn encode_path(path: &Path, buf: &mut BytesMut) -> Result<()> {
    let lossy = path.to_string_lossy();
    let bytes = lossy.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| SyncError::protocol(format!("path too long: {}", path.display())))?;
    buf.put_u16(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Decode a path from reader
fn decode_path<R: Read>(r: &mut R) -> std::io::Result<PathBuf> {
    let len = read_u16(r)? as usize;
    let mut path_buf = vec![0u8; len];
    r.read_exact(&mut path_buf)?;
    Ok(PathBuf::from(String::from_utf8_lossy(&path_buf).into_owned()))
}

fn encode_stat(stat: &Stat, buf: &mut BytesMut) -> Result<()> {
    encode_path(&stat.path, buf)?;
    match &stat.info {
        FileInfo::Directory { mode } => {
            buf.put_u8(kind::DIRECTORY);
            buf.put_u32(*mode);
        }
        FileInfo::File {
            mode,
            size,
            modified,
            identity: id,
        } => {
            buf.put_u8(kind::FILE);
            buf.put_u32(*mode);
            buf.put_u64(*size);
            buf.put_i64(*modified);
            match id {
                ContentIdentity::Inode { dev, ino } => {
                    buf.put_u8(identity::INODE);
                    buf.put_u64(*dev);
                    buf.put_u64(*ino);
                }
                ContentIdentity::HardLink(first) => {
                    buf.put_u8(identity::HARD_LINK);
                    encode_path(first, buf)?;
                }
            }
        }
        FileInfo::Symlink { target } => {
            buf.put_u8(kind::SYMLINK);
            buf.put_u32(0o777);
            encode_path(target, buf)?;
        }
        FileInfo::Removed => {
            return Err(SyncError::protocol(format!(
                "cannot send removed entry {}",
                stat.path.display()
            )));
        }
    }
    Ok(())
}

fn decode_stat<R: Read>(r: &mut R) -> std::io::Result<Stat> {
    let path = decode_path(r)?;
    let entry_kind = read_u8(r)?;
    let mode = read_u32(r)?;

    let info = match entry_kind {
        kind::DIRECTORY => FileInfo::Directory { mode },
        kind::FILE => {
            let size = read_u64(r)?;
            let modified = read_u64(r)? as i64;
            let id = match read_u8(r)? {
                identity::INODE => ContentIdentity::Inode {
                    dev: read_u64(r)?,
                    ino: read_u64(r)?,
                },
                identity::HARD_LINK => ContentIdentity::HardLink(decode_path(r)?),
                other => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unknown identity tag {other}"),
                    ));
                }
            };
            FileInfo::File {
                mode,
                size,
                modified,
                identity: id,
            }
        }
        kind::SYMLINK => FileInfo::Symlink {
            target: decode_path(r)?,
        },
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown entry kind {other}"),
            ));
        }
    };

    Ok(Stat::new(path, info))
}

fn read_u8<R: Read>(r: &mut R) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(r: &mut R) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}
