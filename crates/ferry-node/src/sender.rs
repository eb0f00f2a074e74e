//! Sender engine
//!
//! Drives the outbound side of a transfer over one stream: validate
//! the receiver's handshake, send the manifest, read the resume
//! offsets, stream each file from its trusted offset, then signal
//! completion. Reconnection is the front-end's job; a retryable
//! error here means "hand me a fresh stream and run me again".

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use ferry_core::error::TransferError;
use ferry_core::manifest::{build_manifest, HashProgressFn, Manifest, ManifestOptions};
use ferry_core::path::safe_join;
use ferry_core::protocol::{
    FileStartPayload, Frame, HandshakeAckPayload, HandshakePayload, MessageKind, ResumePayload,
};
use ferry_core::{COPY_BUF_SIZE, STREAM_BUF_SIZE};

use crate::compress;
use crate::stream::{
    deadline, expect_frame, read_frame, write_frame, AsyncStream, BoxReader, BoxWriter,
};
use crate::{ProgressFn, StartFileFn, COMPLETE_LINGER, STREAM_TIMEOUT};

pub struct Sender {
    root: PathBuf,
    root_is_file: bool,
    code: String,
    compress: bool,
    manifest: Manifest,
    on_start_file: Option<Arc<StartFileFn>>,
    on_progress: Option<Arc<ProgressFn>>,
}

impl Sender {
    /// Build the manifest for `root` and prepare a sender for it.
    pub fn new(
        root: impl Into<PathBuf>,
        code: impl Into<String>,
        opts: ManifestOptions,
        on_hash: Option<&HashProgressFn>,
    ) -> Result<Self, TransferError> {
        let root = root.into();
        let manifest = build_manifest(&root, opts, on_hash)?;
        let root_is_file = std::fs::metadata(&root)?.is_file();
        Ok(Self {
            root,
            root_is_file,
            code: code.into(),
            compress: false,
            manifest,
            on_start_file: None,
            on_progress: None,
        })
    }

    /// Prepare a sender for an already-built manifest.
    pub fn with_manifest(
        root: impl Into<PathBuf>,
        code: impl Into<String>,
        manifest: Manifest,
    ) -> Self {
        let root = root.into();
        let root_is_file = std::fs::metadata(&root).map(|m| m.is_file()).unwrap_or(false);
        Self {
            root,
            root_is_file,
            code: code.into(),
            compress: false,
            manifest,
            on_start_file: None,
            on_progress: None,
        }
    }

    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn on_start_file(
        mut self,
        f: impl Fn(&str, usize, usize) + Send + Sync + 'static,
    ) -> Self {
        self.on_start_file = Some(Arc::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(&str, u64, u64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Run one transfer attempt over `stream`.
    pub async fn run<S: AsyncStream + 'static>(&self, stream: S) -> Result<(), TransferError> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: BoxReader = Box::new(read_half);
        let mut writer: BoxWriter = Box::new(write_half);

        self.handshake(&mut reader, &mut writer).await?;

        // Everything after the handshake may travel compressed.
        let mut reader = compress::wrap_reader(reader, self.compress);
        let writer = compress::wrap_writer(writer, self.compress).await?;
        let mut writer = BufWriter::with_capacity(STREAM_BUF_SIZE, writer);

        self.send(&mut reader, &mut writer).await
    }

    /// Validate the receiver's handshake and acknowledge it.
    ///
    /// Older peers send the bare code bytes instead of the
    /// structured payload; both are accepted.
    async fn handshake(
        &self,
        reader: &mut BoxReader,
        writer: &mut BoxWriter,
    ) -> Result<(), TransferError> {
        let frame = read_frame(reader).await?;
        if frame.kind != MessageKind::Handshake {
            return Err(TransferError::protocol(format!(
                "expected Handshake, got {:?}",
                frame.kind
            )));
        }

        let offered = match frame.decode_payload::<HandshakePayload>() {
            Ok(payload) => payload.code,
            Err(_) => String::from_utf8_lossy(&frame.payload).into_owned(),
        };

        if offered != self.code {
            warn!("handshake with wrong code rejected");
            let _ = write_frame(
                writer,
                &Frame::raw(MessageKind::Error, &b"invalid connection code"[..]),
            )
            .await;
            return Err(TransferError::protocol("invalid connection code"));
        }

        write_frame(
            writer,
            &Frame::json(
                MessageKind::HandshakeAck,
                &HandshakeAckPayload {
                    compress: self.compress,
                },
            )?,
        )
        .await
    }

    async fn send<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        write_frame(writer, &Frame::json(MessageKind::Manifest, &self.manifest)?).await?;

        let resume: ResumePayload = expect_frame(reader, MessageKind::Resume)
            .await?
            .decode_payload()?;

        let total = self.manifest.files.len();
        for (index, entry) in self.manifest.files.iter().enumerate() {
            let offset = resume
                .files
                .get(&entry.path)
                .copied()
                .unwrap_or(0)
                .min(entry.size);

            if let Some(cb) = &self.on_start_file {
                cb(&entry.path, index + 1, total);
            }

            self.send_file(writer, entry, offset).await?;
        }

        // Drain the buffered writer before signalling completion.
        deadline(STREAM_TIMEOUT, writer.flush()).await?;
        write_frame(writer, &Frame::bare(MessageKind::Complete)).await?;
        info!("transfer complete: {} files", total);

        // Courtesy wait so the receiver's buffers drain before the
        // stream goes away. Never fatal.
        let mut byte = [0u8; 1];
        match tokio::time::timeout(COMPLETE_LINGER, reader.read(&mut byte)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("receiver may not have acknowledged completion: {e}"),
            Err(_) => debug!("no close observed within the linger window"),
        }

        Ok(())
    }

    async fn send_file<W>(
        &self,
        writer: &mut W,
        entry: &ferry_core::FileEntry,
        offset: u64,
    ) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        write_frame(
            writer,
            &Frame::json(
                MessageKind::FileStart,
                &FileStartPayload {
                    path: entry.path.clone(),
                    size: entry.size,
                    offset,
                },
            )?,
        )
        .await?;

        if offset == entry.size {
            // Nothing left to stream for this file.
            return write_frame(writer, &Frame::bare(MessageKind::FileEnd)).await;
        }

        let path = if self.root_is_file {
            self.root.clone()
        } else {
            safe_join(&self.root, &entry.path)?
        };

        let mut file = tokio::fs::File::open(&path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        let mut remaining = entry.size - offset;
        let mut pos = offset;
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "short read from {}: {} of {} bytes missing",
                        entry.path, remaining, entry.size
                    ),
                )));
            }

            deadline(STREAM_TIMEOUT, writer.write_all(&buf[..n])).await?;
            pos += n as u64;
            remaining -= n as u64;

            if let Some(cb) = &self.on_progress {
                cb(&entry.path, pos, entry.size);
            }
        }

        write_frame(writer, &Frame::bare(MessageKind::FileEnd)).await
    }
}
