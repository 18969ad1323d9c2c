//! Envelope wire format.
//!
//! Every envelope travels as one length-prefixed frame:
//!
//! ```text
//! [len: u32 BE][target: i64 LE][message_id: i64 LE][payload_len: u64 LE][payload: UTF-8]
//! ```
//!
//! The body after the length prefix is the bincode fixed-int encoding of an
//! [`Envelope`]. The payload carries its own length, so no byte inside it is
//! structural and any string round-trips unchanged.

use std::io;

use bincode::Options;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Envelope;

/// Upper bound on an encoded envelope body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Target, message id and payload length.
const FIXED_FIELDS_LEN: usize = 8 + 8 + 8;

/// Errors raised while encoding, decoding or moving frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("frame too large: {size} bytes (max {max})", max = MAX_FRAME_LEN)]
    FrameTooLarge { size: usize },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_FRAME_LEN as u64)
        .reject_trailing_bytes()
}

/// Encodes the envelope body, without the length prefix.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let size = FIXED_FIELDS_LEN + envelope.payload.len();
    if size > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { size });
    }
    options()
        .serialize(envelope)
        .map_err(|err| CodecError::Malformed(err.to_string()))
}

/// Decodes one envelope body. Trailing bytes are rejected.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { size: bytes.len() });
    }
    options()
        .deserialize(bytes)
        .map_err(|err| CodecError::Malformed(err.to_string()))
}

/// Encodes the envelope and prepends the length prefix.
pub fn frame(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let body = encode(envelope)?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary. A
/// stream that ends mid-frame is [`CodecError::Truncated`]. Not cancel safe:
/// dropping the future part-way loses the bytes already consumed.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    match read_full(reader, &mut len_buf).await? {
        0 => return Ok(None),
        LEN_PREFIX => {}
        actual => {
            return Err(CodecError::Truncated {
                expected: LEN_PREFIX,
                actual,
            })
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { size: len });
    }

    let mut body = vec![0u8; len];
    let actual = read_full(reader, &mut body).await?;
    if actual < len {
        return Err(CodecError::Truncated {
            expected: len,
            actual,
        });
    }

    decode(&body).map(Some)
}

/// Like `read_exact`, but reports how much was read before EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
