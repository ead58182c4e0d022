//! Wire codec: length-prefixed, big-endian framing plus typed scalar and
//! string (de)serialization for the RPC layer.
//!
//! A packet on the wire is `[len: u32][payload]`, where `len` counts the
//! bytes of `payload` only (header plus arguments). The payload is
//! decoded only once every byte has arrived — [`read_frame`] buffers a
//! whole frame before handing it to a caller-supplied decoder.

pub mod header;
pub mod primitive;

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use header::{ReplyHeader, RequestHeader};

/// Result of codec operations with error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum frame size (including header), in bytes. Connections that try
/// to send or receive a larger frame are aborted.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// [`codec`](self) errors.
#[derive(Debug)]
pub enum Error {
    /// The underlying stream failed or closed mid-frame.
    Io(io::Error),
    /// A declared frame length exceeded [`MAX_FRAME_SIZE`].
    FrameTooLarge(u32),
    /// A request payload could not be decoded into the shape a handler
    /// expected.
    UnmarshalArgs,
    /// A reply payload could not be decoded into the shape a caller
    /// expected.
    UnmarshalReply,
    /// A length-prefixed string was not valid UTF-8.
    InvalidString(std::string::FromUtf8Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "codec io error: {e}"),
            Error::FrameTooLarge(len) => write!(f, "frame of {len} bytes exceeds maximum"),
            Error::UnmarshalArgs => write!(f, "failed to unmarshal request arguments"),
            Error::UnmarshalReply => write!(f, "failed to unmarshal reply"),
            Error::InvalidString(e) => write!(f, "invalid utf-8 string: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Reads one complete frame (length prefix consumed, only the payload
/// bytes returned) from an async stream.
///
/// Resumes correctly across partial reads: `read_exact` internally loops
/// until the requested number of bytes has arrived or the stream dies.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len as usize > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes one complete frame (length prefix plus payload) to an async
/// stream, flushing so the peer observes the bytes promptly.
pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(payload.len() as u32));
    }
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Prepends the `[len: u32]` prefix to `payload` in place, producing the
/// bytes [`connection::Connection::send`](crate::connection::Connection::send)
/// expects to hand to a single `write_all`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let payload = b"hello world".to_vec();
        let framed = frame(&payload);
        let mut cursor = Cursor::new(framed);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn rejects_oversized_frame_length() {
        let mut len_buf = Vec::new();
        len_buf.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        let mut cursor = Cursor::new(len_buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn resumes_across_partial_reads() {
        let payload = vec![7u8; 4096];
        let framed = frame(&payload);
        // Split the frame into byte-sized async reads.
        struct Trickle(Cursor<Vec<u8>>);
        impl AsyncRead for Trickle {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                let mut one = [0u8; 1];
                let n = std::io::Read::read(&mut self.0, &mut one).unwrap_or(0);
                if n == 1 {
                    buf.put_slice(&one);
                }
                std::task::Poll::Ready(Ok(()))
            }
        }
        let mut trickle = Trickle(Cursor::new(framed));
        let decoded = read_frame(&mut trickle).await.unwrap();
        assert_eq!(decoded, payload);
    }
}
