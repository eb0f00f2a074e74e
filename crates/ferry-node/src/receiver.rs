//! Receiver engine
//!
//! Drives the inbound side: open with a handshake, confirm the
//! manifest, compute trusted resume offsets from what is already on
//! disk, then stream every file to a validated path with running
//! BLAKE3 verification. Every manifest path is validated before any
//! disk write happens.

use std::collections::BTreeMap;
use std::io::{self, Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use ferry_core::error::TransferError;
use ferry_core::manifest::{read_full_block, FileEntry, Manifest};
use ferry_core::path::safe_join;
use ferry_core::protocol::{
    FileStartPayload, Frame, HandshakeAckPayload, HandshakePayload, MessageKind, ResumePayload,
};
use ferry_core::{COPY_BUF_SIZE, STREAM_BUF_SIZE};

use crate::compress;
use crate::stream::{
    deadline, expect_frame, read_frame, write_frame, AsyncStream, BoxReader, BoxWriter,
};
use crate::{ConfirmFn, ProgressFn, StartFileFn, STREAM_TIMEOUT};

pub struct Receiver {
    dest: PathBuf,
    code: String,
    fast_resume: bool,
    manifest: Option<Manifest>,
    on_start_file: Option<Arc<StartFileFn>>,
    on_progress: Option<Arc<ProgressFn>>,
    on_confirm: Option<Arc<ConfirmFn>>,
}

impl Receiver {
    pub fn new(dest: impl Into<PathBuf>, code: impl Into<String>) -> Self {
        Self {
            dest: dest.into(),
            code: code.into(),
            fast_resume: false,
            manifest: None,
            on_start_file: None,
            on_progress: None,
            on_confirm: None,
        }
    }

    /// Trust existing file lengths instead of verifying blocks.
    pub fn fast_resume(mut self, enabled: bool) -> Self {
        self.fast_resume = enabled;
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

    /// Confirmation hook; returning `false` aborts before any disk
    /// write and tells the sender.
    pub fn on_confirm(mut self, f: impl Fn(&Manifest) -> bool + Send + Sync + 'static) -> Self {
        self.on_confirm = Some(Arc::new(f));
        self
    }

    /// The manifest of the last (possibly failed) attempt.
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Run one transfer attempt over `stream`.
    pub async fn run<S: AsyncStream + 'static>(&mut self, stream: S) -> Result<(), TransferError> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: BoxReader = Box::new(read_half);
        let mut writer: BoxWriter = Box::new(write_half);

        write_frame(
            &mut writer,
            &Frame::json(
                MessageKind::Handshake,
                &HandshakePayload {
                    code: self.code.clone(),
                },
            )?,
        )
        .await?;

        let ack: HandshakeAckPayload = expect_frame(&mut reader, MessageKind::HandshakeAck)
            .await?
            .decode_payload()?;

        let mut reader: BoxReader = Box::new(BufReader::with_capacity(
            STREAM_BUF_SIZE,
            compress::wrap_reader(reader, ack.compress),
        ));
        let mut writer = compress::wrap_writer(writer, ack.compress).await?;

        let manifest: Manifest = expect_frame(&mut reader, MessageKind::Manifest)
            .await?
            .decode_payload()?;
        self.manifest = Some(manifest.clone());

        if let Some(confirm) = &self.on_confirm {
            if !confirm(&manifest) {
                let _ = write_frame(
                    &mut writer,
                    &Frame::raw(MessageKind::Error, &b"Transfer rejected"[..]),
                )
                .await;
                return Err(TransferError::Aborted);
            }
        }

        let dest_folder = safe_join(&self.dest, &manifest.folder_name)?;

        // Validate every path and compute resume offsets before the
        // first disk write.
        let mut offsets: BTreeMap<String, u64> = BTreeMap::new();
        for entry in &manifest.files {
            let local = safe_join(&dest_folder, &entry.path)?;
            let offset = trusted_offset(&local, entry, self.fast_resume).await?;
            if offset > 0 {
                debug!("resuming {} at {offset}", entry.path);
                offsets.insert(entry.path.clone(), offset);
            }
        }

        tokio::fs::create_dir_all(&dest_folder).await?;

        write_frame(
            &mut writer,
            &Frame::json(MessageKind::Resume, &ResumePayload { files: offsets })?,
        )
        .await?;

        let total = manifest.files.len();
        let mut file_count = 0usize;
        loop {
            let frame = read_frame(&mut reader).await?;
            match frame.kind {
                MessageKind::FileStart => {
                    file_count += 1;
                    self.receive_file(&mut reader, &frame, &dest_folder, &manifest, file_count)
                        .await?;
                }
                MessageKind::Complete => {
                    info!("transfer complete: {total} files");
                    return Ok(());
                }
                MessageKind::Error => {
                    return Err(TransferError::Remote(
                        String::from_utf8_lossy(&frame.payload).into_owned(),
                    ))
                }
                other => {
                    return Err(TransferError::protocol(format!(
                        "unexpected message: {other:?}"
                    )))
                }
            }
        }
    }

    async fn receive_file(
        &self,
        reader: &mut BoxReader,
        start_frame: &Frame,
        dest_folder: &Path,
        manifest: &Manifest,
        index: usize,
    ) -> Result<(), TransferError> {
        let start: FileStartPayload = start_frame.decode_payload()?;

        let entry = manifest.find(&start.path).ok_or_else(|| {
            TransferError::protocol(format!("file not in manifest: {}", start.path))
        })?;
        if start.offset > start.size {
            return Err(TransferError::protocol(format!(
                "offset {} beyond size {} for {}",
                start.offset, start.size, start.path
            )));
        }

        if let Some(cb) = &self.on_start_file {
            cb(&start.path, index, manifest.files.len());
        }

        if start.offset == start.size {
            // Fully resumed; the sender still frames it. Empty files
            // carry no bytes at all, so materialize them here.
            let local = safe_join(dest_folder, &start.path)?;
            if start.size == 0 && tokio::fs::metadata(&local).await.is_err() {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::File::create(&local).await?;
            }
            expect_frame(reader, MessageKind::FileEnd).await?;
            return Ok(());
        }

        let local = safe_join(dest_folder, &start.path)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The whole-file hash must cover the resumed prefix too.
        let mut hasher = if start.offset > 0 {
            hash_prefix(&local, start.offset).await?
        } else {
            blake3::Hasher::new()
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true);
        if start.offset > 0 {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let mut file = options.open(&local).await?;

        if start.offset > 0 {
            let end_pos = file.seek(SeekFrom::End(0)).await?;
            if end_pos != start.offset {
                file.set_len(start.offset).await?;
            }
        }

        let mut remaining = start.size - start.offset;
        let mut pos = start.offset;
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = deadline(STREAM_TIMEOUT, reader.read(&mut buf[..want])).await?;
            if n == 0 {
                return Err(TransferError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "unexpected EOF in {}: {} of {} bytes missing",
                        start.path, remaining, start.size
                    ),
                )));
            }

            file.write_all(&buf[..n]).await?;
            hasher.update(&buf[..n]);
            pos += n as u64;
            remaining -= n as u64;

            if let Some(cb) = &self.on_progress {
                cb(&start.path, pos, start.size);
            }
        }

        file.flush().await?;

        expect_frame(reader, MessageKind::FileEnd).await?;

        if !entry.checksum.is_empty() {
            let actual = hex::encode(hasher.finalize().as_bytes());
            if actual != entry.checksum {
                return Err(TransferError::Integrity {
                    path: start.path,
                    expected: entry.checksum.clone(),
                    actual,
                });
            }
        }

        Ok(())
    }
}

/// Compute how many leading bytes of the local file can be trusted.
///
/// Absent file: 0. Larger than the manifest entry: 0 (treated as
/// corrupt, overwritten from scratch). Fast resume or no block
/// hashes: the existing length. Otherwise the file is walked block
/// by block and bytes count only while digests keep matching.
pub async fn trusted_offset(
    local: &Path,
    entry: &FileEntry,
    fast_resume: bool,
) -> Result<u64, TransferError> {
    let local = local.to_path_buf();
    let entry = entry.clone();
    tokio::task::spawn_blocking(move || verify_local_file(&local, &entry, fast_resume))
        .await
        .map_err(|e| {
            TransferError::Io(io::Error::other(format!("offset verification failed: {e}")))
        })
}

fn verify_local_file(local: &Path, entry: &FileEntry, fast_resume: bool) -> u64 {
    let Ok(meta) = std::fs::metadata(local) else {
        return 0;
    };
    if !meta.is_file() {
        return 0;
    }
    if meta.len() > entry.size {
        return 0;
    }
    if fast_resume || entry.block_hashes.is_empty() {
        return meta.len();
    }

    let Ok(mut file) = std::fs::File::open(local) else {
        return 0;
    };

    let block_size = entry.effective_block_size() as usize;
    let mut buf = vec![0u8; block_size];
    let mut validated = 0u64;

    for expected in &entry.block_hashes {
        let n = match read_full_block(&mut file, &mut buf) {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        let digest = hex::encode(blake3::hash(&buf[..n]).as_bytes());
        if digest != *expected {
            break;
        }
        validated += n as u64;
        if n < block_size {
            break;
        }
    }

    validated
}

/// Hash the existing prefix `[0, offset)` of a resumed file.
async fn hash_prefix(local: &Path, offset: u64) -> Result<blake3::Hasher, TransferError> {
    let local = local.to_path_buf();
    tokio::task::spawn_blocking(move || -> io::Result<blake3::Hasher> {
        let mut hasher = blake3::Hasher::new();
        let mut file = std::fs::File::open(&local)?;
        let mut remaining = offset;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "existing file shorter than resume offset",
                ));
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(hasher)
    })
    .await
    .map_err(|e| TransferError::Io(io::Error::other(format!("prefix hashing failed: {e}"))))?
    .map_err(TransferError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::manifest::hash_file_with_block_size;
    use std::fs;
    use tempfile::tempdir;

    fn entry_for(data: &[u8], block_size: u64, dir: &Path) -> FileEntry {
        let src = dir.join("src.bin");
        fs::write(&src, data).unwrap();
        let (checksum, block_hashes) = hash_file_with_block_size(&src, block_size).unwrap();
        FileEntry {
            path: "src.bin".into(),
            size: data.len() as u64,
            mode: 0o644,
            checksum,
            block_hashes,
            block_size,
        }
    }

    #[tokio::test]
    async fn absent_file_starts_from_zero() {
        let dir = tempdir().unwrap();
        let entry = entry_for(b"abcdef", 4, dir.path());
        let offset = trusted_offset(&dir.path().join("missing"), &entry, false)
            .await
            .unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn oversized_file_is_treated_as_corrupt() {
        let dir = tempdir().unwrap();
        let entry = entry_for(b"abcdef", 4, dir.path());
        let local = dir.path().join("local.bin");
        fs::write(&local, b"abcdefgh").unwrap();
        let offset = trusted_offset(&local, &entry, false).await.unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn fast_resume_trusts_length() {
        let dir = tempdir().unwrap();
        let entry = entry_for(b"abcdef", 4, dir.path());
        let local = dir.path().join("local.bin");
        fs::write(&local, b"XYZ").unwrap(); // wrong bytes, length trusted
        let offset = trusted_offset(&local, &entry, true).await.unwrap();
        assert_eq!(offset, 3);
    }

    #[tokio::test]
    async fn block_walk_stops_at_first_mismatch() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..64u8).collect();
        let entry = entry_for(&data, 16, dir.path());

        // Two intact blocks, then divergence inside the third.
        let mut partial = data[..40].to_vec();
        partial[36] ^= 0xff;
        let local = dir.path().join("local.bin");
        fs::write(&local, &partial).unwrap();

        let offset = trusted_offset(&local, &entry, false).await.unwrap();
        assert_eq!(offset, 32);
    }

    #[tokio::test]
    async fn matching_partial_final_block_counts() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..40u8).collect();
        let entry = entry_for(&data, 16, dir.path());

        // A file cut mid-block fails that block's digest.
        let local = dir.path().join("cut.bin");
        fs::write(&local, &data[..24]).unwrap();
        let offset = trusted_offset(&local, &entry, false).await.unwrap();
        assert_eq!(offset, 16);

        // The true final short block verifies in full.
        let local = dir.path().join("full.bin");
        fs::write(&local, &data).unwrap();
        let offset = trusted_offset(&local, &entry, false).await.unwrap();
        assert_eq!(offset, 40);
    }

    #[tokio::test]
    async fn no_block_hashes_falls_back_to_length() {
        let dir = tempdir().unwrap();
        let mut entry = entry_for(b"abcdef", 4, dir.path());
        entry.block_hashes.clear();

        let local = dir.path().join("local.bin");
        fs::write(&local, b"abc").unwrap();
        let offset = trusted_offset(&local, &entry, false).await.unwrap();
        assert_eq!(offset, 3);
    }
}
