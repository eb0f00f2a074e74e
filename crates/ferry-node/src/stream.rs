//! Framed stream I/O with deadlines
//!
//! Reads and writes [`Frame`]s over any async byte stream. Every
//! operation carries the 60 s stream deadline; an expired deadline
//! surfaces as an I/O timeout, which the error classifier treats as
//! retryable. The frame size bound is enforced before the payload
//! buffer is allocated.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use ferry_core::error::TransferError;
use ferry_core::protocol::{decode_frame, encode_frame, Frame, MessageKind};
use ferry_core::MAX_MESSAGE_SIZE;

use crate::STREAM_TIMEOUT;

/// Any full-duplex async byte stream usable as a transfer stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A transfer stream behind the `Host` seam.
pub type BoxStream = Box<dyn AsyncStream>;

/// Boxed read half of a transfer stream, possibly wrapped for
/// buffering or decompression.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Boxed write half of a transfer stream.
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Await `fut` under `limit`, mapping expiry to an I/O timeout.
pub(crate) async fn deadline<T>(
    limit: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, TransferError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(TransferError::from),
        Err(_) => Err(TransferError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "i/o timeout",
        ))),
    }
}

/// Read one frame. Fails without allocating when the length prefix
/// exceeds [`MAX_MESSAGE_SIZE`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    deadline(STREAM_TIMEOUT, reader.read_exact(&mut len_buf)).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TransferError::protocol(format!(
            "message too large: {len} > {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut body = vec![0u8; len];
    deadline(STREAM_TIMEOUT, reader.read_exact(&mut body)).await?;
    decode_frame(&body)
}

/// Write one frame and flush, so a buffered stream never leaves the
/// remote stalled on a partial message.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_frame(frame)?;
    deadline(STREAM_TIMEOUT, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
}

/// Read a frame and require a specific kind; `Error` frames surface
/// as remote errors, anything else as a protocol violation.
pub async fn expect_frame<R>(reader: &mut R, want: MessageKind) -> Result<Frame, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let frame = read_frame(reader).await?;
    if frame.kind == want {
        return Ok(frame);
    }
    match frame.kind {
        MessageKind::Error => Err(TransferError::Remote(
            String::from_utf8_lossy(&frame.payload).into_owned(),
        )),
        other => Err(TransferError::protocol(format!(
            "expected {want:?}, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::protocol::HandshakePayload;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let frame = Frame::json(
            MessageKind::Handshake,
            &HandshakePayload {
                code: "123-456".into(),
            },
        )
        .unwrap();
        write_frame(&mut a, &frame).await.unwrap();

        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let len = (MAX_MESSAGE_SIZE as u32) + 1;
        a.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)), "{err}");
        assert!(err.to_string().contains("message too large"));
    }

    #[tokio::test]
    async fn expect_frame_surfaces_remote_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, &Frame::raw(MessageKind::Error, &b"boom"[..]))
            .await
            .unwrap();

        let err = expect_frame(&mut b, MessageKind::Manifest).await.unwrap_err();
        match err {
            TransferError::Remote(msg) => assert_eq!(msg, "boom"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expect_frame_flags_wrong_kind() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, &Frame::bare(MessageKind::Complete))
            .await
            .unwrap();

        let err = expect_frame(&mut b, MessageKind::FileEnd).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }
}
