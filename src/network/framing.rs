//! Multipart framing for the publish/subscribe sockets.
//!
//! Each multipart message travels as one `LengthDelimitedCodec` frame holding
//! a u32 part count followed by length-prefixed parts (big endian).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::constants::MAX_FRAME_LENGTH;

/// Control frame a subscriber sends to add a filter.
pub const SUBSCRIBE: &[u8] = b"SUB";
/// Control frame a subscriber sends to drop a filter.
pub const UNSUBSCRIBE: &[u8] = b"UNSUB";

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode_multipart(parts: &[Bytes]) -> Bytes {
    let size = 4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(parts.len() as u32);
    for part in parts {
        buf.put_u32(part.len() as u32);
        buf.put_slice(part);
    }
    buf.freeze()
}

pub fn decode_multipart(mut frame: Bytes) -> Result<Vec<Bytes>, String> {
    if frame.remaining() < 4 {
        return Err("truncated part count".into());
    }
    let count = frame.get_u32() as usize;
    let mut parts = Vec::with_capacity(count.min(16));
    for i in 0..count {
        if frame.remaining() < 4 {
            return Err(format!("truncated length of part {}", i));
        }
        let len = frame.get_u32() as usize;
        if frame.remaining() < len {
            return Err(format!("truncated part {}", i));
        }
        parts.push(frame.split_to(len));
    }
    if frame.has_remaining() {
        return Err(format!("{} trailing bytes", frame.remaining()));
    }
    Ok(parts)
}

/// Framed writer for multipart messages
pub struct MultipartSink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> MultipartSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec()),
        }
    }

    pub async fn send(&mut self, parts: &[Bytes]) -> Result<(), String> {
        self.inner
            .send(encode_multipart(parts))
            .await
            .map_err(|e| format!("Send error: {}", e))
    }
}

/// Framed reader for multipart messages
pub struct MultipartStream<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> MultipartStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, codec()),
        }
    }

    /// Receive the next message (or None if the stream closed)
    pub async fn recv(&mut self) -> Result<Option<Vec<Bytes>>, String> {
        match self.inner.next().await {
            Some(Ok(bytes)) => decode_multipart(bytes.freeze()).map(Some),
            Some(Err(e)) => Err(format!("Read error: {}", e)),
            None => Ok(None),
        }
    }
}
