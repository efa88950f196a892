//! Framing: length-prefix (4 bytes LE) + UTF-8 JSON envelope.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::protocol::{Message, MAX_MESSAGE_LEN};

const LEN_SIZE: usize = 4;

/// Serialize a message to its JSON payload (no length prefix).
pub fn serialize(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    msg.to_json().map_err(FrameEncodeError::Encode)
}

/// Deserialize a JSON payload. `None` on anything malformed; never panics or errors.
pub fn deserialize(bytes: &[u8]) -> Option<Message> {
    if bytes.is_empty() {
        return None;
    }
    Message::from_json(bytes)
}

fn length_in_bounds(len: u32) -> bool {
    len > 0 && len <= MAX_MESSAGE_LEN
}

/// Encode a message into a single frame: 4 bytes LE length + JSON payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serialize(msg)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if !length_in_bounds(len) {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (JSON or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if !length_in_bounds(len) {
        return Err(FrameDecodeError::InvalidLength(len));
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).ok_or(FrameDecodeError::Malformed)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, bad length, or unparseable payload).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("invalid message length: {0}")]
    InvalidLength(u32),
    #[error("malformed payload")]
    Malformed,
}

/// Errors from stream send/receive. A peer that merely went away is not an error
/// (see [`receive_message`]).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("invalid message length: {0}")]
    InvalidLength(u32),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

/// Write one framed message and flush, bounded by `timeout`.
pub async fn send_message<W>(writer: &mut W, msg: &Message, timeout: Duration) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    tokio::time::timeout(timeout, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| WireError::Timeout)??;
    Ok(())
}

/// Read one framed message, bounded by `timeout`.
///
/// `Ok(None)` means the peer closed the connection (fewer than 4 header bytes, or the
/// payload ended early) or sent an unparseable payload. A length outside `(0, 10 MiB]`
/// is a hard protocol error.
pub async fn receive_message<R>(reader: &mut R, timeout: Duration) -> Result<Option<Message>, WireError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, receive_inner(reader))
        .await
        .map_err(|_| WireError::Timeout)?
}

async fn receive_inner<R>(reader: &mut R) -> Result<Option<Message>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    if read_full(reader, &mut len_buf).await? < LEN_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if !length_in_bounds(len) {
        return Err(WireError::InvalidLength(len));
    }
    let mut payload = vec![0u8; len as usize];
    if read_full(reader, &mut payload).await? < payload.len() {
        debug!(expected = len, "stream closed mid-frame");
        return Ok(None);
    }
    let msg = deserialize(&payload);
    if msg.is_none() {
        debug!(len, "dropping unparseable frame");
    }
    Ok(msg)
}

/// Read until `buf` is full or the stream ends. Returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
