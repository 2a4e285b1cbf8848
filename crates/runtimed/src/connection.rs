//! Connection framing and handshake for the runtimed socket.
//!
//! All connections to the daemon use length-prefixed binary framing:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [payload bytes]
//! ```
//!
//! The first frame on every connection is a JSON handshake declaring the
//! channel. On the notebook sync channel every later frame carries a
//! one-byte type prefix so Automerge sync traffic, requests, responses and
//! broadcasts can share one stream.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size for data frames: 100 MiB (matches blob size limit).
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Maximum frame size for control/handshake frames: 64 KiB.
const MAX_CONTROL_FRAME_SIZE: usize = 64 * 1024;

/// Protocol identifier for typed notebook frames.
pub const PROTOCOL_V2: &str = "v2";

/// Channel handshake, the first frame on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Handshake {
    /// Automerge notebook sync plus kernel requests/broadcasts (per-notebook room).
    NotebookSync {
        notebook_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    /// Blob store: query the HTTP port.
    Blob,
}

/// Sent by the daemon right after a `NotebookSync` handshake that asked for
/// typed frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolCapabilities {
    pub protocol: String,
}

/// Frame type prefix on the notebook sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotebookFrameType {
    /// Automerge sync message (binary).
    AutomergeSync = 0x00,
    /// JSON `NotebookRequest` (client → daemon).
    Request = 0x01,
    /// JSON `NotebookResponse` (daemon → client), in request order.
    Response = 0x02,
    /// JSON `NotebookBroadcast` (daemon → every client in the room).
    Broadcast = 0x03,
}

impl TryFrom<u8> for NotebookFrameType {
    type Error = std::io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::AutomergeSync),
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Broadcast),
            k => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown frame type: 0x{:02x}", k),
            )),
        }
    }
}

/// A frame received on the notebook sync channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedFrame {
    pub frame_type: NotebookFrameType,
    pub payload: Vec<u8>,
}

/// Send a length-prefixed frame.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed frame with a caller-specified size limit.
/// Returns `None` on clean disconnect (EOF).
async fn recv_frame_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, max_size),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Receive a length-prefixed frame (up to 100 MiB for data payloads).
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    recv_frame_with_limit(reader, MAX_FRAME_SIZE).await
}

/// Receive a frame with the 64 KiB control limit. Use for handshakes and
/// blob-channel replies.
pub async fn recv_control_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    recv_frame_with_limit(reader, MAX_CONTROL_FRAME_SIZE).await
}

/// Send a value as a JSON-encoded length-prefixed frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> anyhow::Result<()> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await?;
    Ok(())
}

/// Receive and deserialize a JSON control frame.
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> anyhow::Result<Option<T>> {
    match recv_control_frame(reader).await? {
        Some(data) => {
            let value = serde_json::from_slice(&data)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Send a frame with a type prefix byte.
///
/// The frame format is: `[4 bytes: length] [1 byte: type] [payload bytes]`
pub async fn send_typed_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_type: NotebookFrameType,
    data: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(1 + data.len());
    frame.push(frame_type as u8);
    frame.extend_from_slice(data);
    send_frame(writer, &frame).await
}

/// Receive a frame and split off the type prefix byte.
///
/// Returns `None` on clean disconnect (EOF), and an error if the frame is
/// empty or has an unknown type.
pub async fn recv_typed_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<TypedFrame>> {
    match recv_frame(reader).await? {
        Some(frame) if frame.is_empty() => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty typed frame",
        )),
        Some(mut frame) => {
            let frame_type = NotebookFrameType::try_from(frame[0])?;
            frame.remove(0);
            Ok(Some(TypedFrame {
                frame_type,
                payload: frame,
            }))
        }
        None => Ok(None),
    }
}
