//! Downstream protocol messages.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8), error messages use a u32 length.
//! Frame format: len:u32 | type:u8 | payload (len counts the payload only)
//!
//! Calls and their framing:
//!
//! ```text
//! changes_count:  ChangesCountRequest  ->  ChangeAmount | Error
//! changes:        ChangesRequest       ->  ChangeChunk* ChangesEnd | Error
//! download:       DownloadRequest PathList* PathListEnd
//!                                      ->  Chunk* DownloadEnd | Chunk* Error
//! ```

use crate::error::{Result, SyncError};
use crate::snapshot::{Change, ChangeKind};
use crate::transport::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Maximum frame payload (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Size of a frame header (len + type)
pub const FRAME_HEADER_SIZE: usize = 5;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    ChangesCountRequest = 0x02,
    ChangeAmount = 0x03,
    ChangesRequest = 0x04,
    ChangeChunk = 0x05,
    ChangesEnd = 0x06,
    DownloadRequest = 0x07,
    PathList = 0x08,
    PathListEnd = 0x09,
    Chunk = 0x0A,
    DownloadEnd = 0x0B,
    Error = 0x0C,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::ChangesCountRequest),
            0x03 => Some(Self::ChangeAmount),
            0x04 => Some(Self::ChangesRequest),
            0x05 => Some(Self::ChangeChunk),
            0x06 => Some(Self::ChangesEnd),
            0x07 => Some(Self::DownloadRequest),
            0x08 => Some(Self::PathList),
            0x09 => Some(Self::PathListEnd),
            0x0A => Some(Self::Chunk),
            0x0B => Some(Self::DownloadEnd),
            0x0C => Some(Self::Error),
            _ => None,
        }
    }
}

// =============================================================================
// Change Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChangeFlags: u8 {
        const DIR = 1 << 0;
    }
}

const CHANGE_KIND_UPSERT: u8 = 0;
const CHANGE_KIND_DELETE: u8 = 1;

// =============================================================================
// Encoding helpers
// =============================================================================

fn frame(msg_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a message that has no payload.
pub fn empty_frame(msg_type: MessageType) -> Bytes {
    frame(msg_type, &[])
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        SyncError::protocol(format!(
            "String of {} bytes exceeds the {} byte frame limit",
            s.len(),
            u16::MAX
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(SyncError::protocol(format!("{} length truncated", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(SyncError::protocol(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        )));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::protocol(format!("Invalid UTF-8 in {}", what)))
}

fn ensure(payload: &Bytes, needed: usize, what: &str) -> Result<()> {
    if payload.remaining() < needed {
        return Err(SyncError::protocol(format!("{} payload too short", what)));
    }
    Ok(())
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
}

impl Hello {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> Bytes {
        frame(MessageType::Hello, &self.version.to_be_bytes())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 2, "Hello")?;
        Ok(Self {
            version: payload.get_u16(),
        })
    }
}

impl Default for Hello {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CHANGE_AMOUNT (0x03)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeAmount {
    pub amount: i64,
}

impl ChangeAmount {
    pub fn encode(&self) -> Bytes {
        frame(MessageType::ChangeAmount, &self.amount.to_be_bytes())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 8, "ChangeAmount")?;
        Ok(Self {
            amount: payload.get_i64(),
        })
    }
}

// =============================================================================
// CHANGE_CHUNK (0x05)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeChunk {
    pub changes: Vec<Change>,
}

impl ChangeChunk {
    /// kind + path_len + mtime + mtime_nanos + size + flags, excluding the path
    const FIXED_ENTRY_SIZE: usize = 1 + 2 + 8 + 8 + 8 + 1;

    /// Fails when a path does not fit its u16 length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        let payload_len = 4 + self
            .changes
            .iter()
            .map(|c| Self::FIXED_ENTRY_SIZE + c.path.len())
            .sum::<usize>();

        let mut buf = BytesMut::with_capacity(payload_len);
        buf.put_u32(self.changes.len() as u32);
        for change in &self.changes {
            buf.put_u8(match change.kind {
                ChangeKind::Upsert => CHANGE_KIND_UPSERT,
                ChangeKind::Delete => CHANGE_KIND_DELETE,
            });
            put_str(&mut buf, &change.path)?;
            buf.put_i64(change.mtime);
            buf.put_i64(change.mtime_nanos);
            buf.put_u64(change.size);

            let mut flags = ChangeFlags::empty();
            if change.is_dir {
                flags |= ChangeFlags::DIR;
            }
            buf.put_u8(flags.bits());
        }

        Ok(frame(MessageType::ChangeChunk, &buf))
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 4, "ChangeChunk")?;
        let count = payload.get_u32() as usize;

        // Every entry needs at least its fixed part
        if payload.remaining() < count.saturating_mul(Self::FIXED_ENTRY_SIZE) {
            return Err(SyncError::protocol(format!(
                "ChangeChunk truncated: {} changes announced, {} bytes left",
                count,
                payload.remaining()
            )));
        }

        let mut changes = Vec::with_capacity(count);
        for _ in 0..count {
            ensure(&payload, 1, "Change")?;
            let kind = match payload.get_u8() {
                CHANGE_KIND_UPSERT => ChangeKind::Upsert,
                CHANGE_KIND_DELETE => ChangeKind::Delete,
                other => {
                    return Err(SyncError::protocol(format!(
                        "Unknown change kind {}",
                        other
                    )))
                }
            };
            let path = get_str(&mut payload, "Change path")?;
            ensure(&payload, 25, "Change")?;
            let mtime = payload.get_i64();
            let mtime_nanos = payload.get_i64();
            let size = payload.get_u64();
            let flags = ChangeFlags::from_bits_truncate(payload.get_u8());

            changes.push(Change {
                kind,
                path,
                mtime,
                mtime_nanos,
                size,
                is_dir: flags.contains(ChangeFlags::DIR),
            });
        }

        Ok(Self { changes })
    }
}

// =============================================================================
// CHANGES_END (0x06)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangesEnd {
    pub total: u64,
}

impl ChangesEnd {
    pub fn encode(&self) -> Bytes {
        frame(MessageType::ChangesEnd, &self.total.to_be_bytes())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 8, "ChangesEnd")?;
        Ok(Self {
            total: payload.get_u64(),
        })
    }
}

// =============================================================================
// PATH_LIST (0x08)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathList {
    pub paths: Vec<String>,
}

impl PathList {
    /// Fails when a path does not fit its u16 length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        let payload_len = 4 + self.paths.iter().map(|p| 2 + p.len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(payload_len);
        buf.put_u32(self.paths.len() as u32);
        for path in &self.paths {
            put_str(&mut buf, path)?;
        }
        Ok(frame(MessageType::PathList, &buf))
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 4, "PathList")?;
        let count = payload.get_u32() as usize;
        if payload.remaining() < count.saturating_mul(2) {
            return Err(SyncError::protocol("PathList truncated"));
        }

        let mut paths = Vec::with_capacity(count);
        for _ in 0..count {
            paths.push(get_str(&mut payload, "PathList path")?);
        }
        Ok(Self { paths })
    }
}

// =============================================================================
// CHUNK (0x0A)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub content: Bytes,
}

impl Chunk {
    pub fn encode(&self) -> Bytes {
        frame(MessageType::Chunk, &self.content)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        Ok(Self { content: payload })
    }
}

// =============================================================================
// ERROR (0x0C)
// =============================================================================

/// A failed call. The session stays usable after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub message: String,
}

impl Error {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let msg_bytes = self.message.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + msg_bytes.len());
        buf.put_u32(msg_bytes.len() as u32);
        buf.put_slice(msg_bytes);
        frame(MessageType::Error, &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 4, "Error")?;
        let len = payload.get_u32() as usize;
        if payload.remaining() < len {
            return Err(SyncError::protocol("Error message truncated"));
        }
        let message = String::from_utf8_lossy(&payload.copy_to_bytes(len)).into_owned();
        Ok(Self { message })
    }
}

// =============================================================================
// Frame I/O
// =============================================================================

/// A frame as read off the wire. The type byte is kept raw so that unknown
/// message types can be answered instead of tearing down the session.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub msg_type: u8,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream at a
/// frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<RawFrame>> {
    let len = match r.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Io(e).into()),
    };

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::InvalidFrame(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        ))
        .into());
    }

    let msg_type = r.read_u8().await.map_err(TransportError::Io)?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(TransportError::Io)?;

    Ok(Some(RawFrame {
        msg_type,
        payload: Bytes::from(payload),
    }))
}

/// Write a pre-encoded frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.map_err(TransportError::Io)?;
    w.flush().await.map_err(TransportError::Io)?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Version is too old (client needs upgrade)
    TooOld { client: u16, min_supported: u16 },
    /// Version is too new (server needs upgrade)
    TooNew { client: u16, max_supported: u16 },
}

/// Check if a client protocol version is supported.
pub fn negotiate_version(client_version: u16) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
