//! Transfer manifest: data model, hashing, and the parallel builder
//!
//! A manifest fully describes one transfer. Building one walks the
//! root, hashes every file with BLAKE3 (whole-file plus per-block
//! digests), and optionally caches the result as JSON inside the
//! root so a re-send of a large tree can skip the hashing pass.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::TransferError;
use crate::path::to_wire;
use crate::{BLOCK_SIZE, LEGACY_BLOCK_SIZE, MANIFEST_CACHE_NAME};

/// Complete descriptor of a transfer's contents. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub folder_name: String,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
}

impl Manifest {
    /// Look up an entry by its wire path.
    pub fn find(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// One file within a transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path within the transfer root, forward-slash form.
    pub path: String,
    pub size: u64,
    /// POSIX permission bits, best-effort on other platforms.
    pub mode: u32,
    /// Hex BLAKE3-256 of the whole file; empty iff hashing skipped.
    #[serde(default)]
    pub checksum: String,
    /// Hex BLAKE3-256 per block of `block_size` bytes; the final
    /// block may be short.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub block_size: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl FileEntry {
    /// Block granularity for resume verification. Manifests from
    /// older peers carry 0, which means 1 MiB.
    pub fn effective_block_size(&self) -> u64 {
        if self.block_size == 0 {
            LEGACY_BLOCK_SIZE
        } else {
            self.block_size
        }
    }
}

/// Options controlling manifest construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestOptions {
    /// Load/store `.manifest-cache` inside directory roots.
    pub cache: bool,
    /// Skip all hashing (faster start, length-only resume).
    pub skip_hash: bool,
}

/// Callback fired once per file before it is hashed.
pub type HashProgressFn = dyn Fn(&str, u64) + Sync;

/// Build a manifest for a file or directory tree.
///
/// Directory trees are hashed in parallel across the available
/// hardware parallelism; the first error aborts the build. The order
/// of `files` in the result is unspecified.
pub fn build_manifest(
    root: &Path,
    opts: ManifestOptions,
    on_progress: Option<&HashProgressFn>,
) -> Result<Manifest, TransferError> {
    let meta = fs::metadata(root)
        .map_err(|e| io::Error::new(e.kind(), format!("cannot access {}: {e}", root.display())))?;

    let folder_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::Path(format!("root has no name: {}", root.display())))?;

    if !meta.is_dir() {
        if let Some(cb) = on_progress {
            cb(&folder_name, meta.len());
        }
        let (checksum, block_hashes) = if opts.skip_hash {
            (String::new(), Vec::new())
        } else {
            hash_file_blocks(root)?
        };
        return Ok(Manifest {
            folder_name: folder_name.clone(),
            total_size: meta.len(),
            files: vec![FileEntry {
                path: folder_name,
                size: meta.len(),
                mode: permission_bits(&meta),
                checksum,
                block_hashes,
                block_size: BLOCK_SIZE,
            }],
        });
    }

    let cache_path = root.join(MANIFEST_CACHE_NAME);
    let use_cache = opts.cache && !opts.skip_hash;
    if use_cache {
        if let Some(cached) = load_cache(&cache_path) {
            return Ok(cached);
        }
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            TransferError::Io(io::Error::other(format!("walk {}: {e}", root.display())))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name() == MANIFEST_CACHE_NAME {
            continue;
        }
        paths.push(entry.into_path());
    }

    // One hashing job per file; rayon sizes the pool to the hardware.
    let files: Vec<FileEntry> = paths
        .into_par_iter()
        .map(|abs| {
            let meta = fs::metadata(&abs)?;
            let rel = abs.strip_prefix(root).map_err(|_| {
                TransferError::Path(format!("{} is outside the root", abs.display()))
            })?;
            let wire_path = to_wire(rel);

            if let Some(cb) = on_progress {
                cb(&wire_path, meta.len());
            }

            let (checksum, block_hashes) = if opts.skip_hash {
                (String::new(), Vec::new())
            } else {
                hash_file_blocks(&abs)?
            };

            Ok(FileEntry {
                path: wire_path,
                size: meta.len(),
                mode: permission_bits(&meta),
                checksum,
                block_hashes,
                block_size: BLOCK_SIZE,
            })
        })
        .collect::<Result<_, TransferError>>()?;

    let manifest = Manifest {
        folder_name,
        total_size: files.iter().map(|f| f.size).sum(),
        files,
    };

    if use_cache {
        if let Err(e) = store_cache(&cache_path, &manifest) {
            warn!("failed to cache manifest at {}: {e}", cache_path.display());
        }
    }

    Ok(manifest)
}

/// Whole-file and per-block BLAKE3 digests with the default 16 MiB
/// block granularity.
pub fn hash_file_blocks(path: &Path) -> Result<(String, Vec<String>), io::Error> {
    hash_file_with_block_size(path, BLOCK_SIZE)
}

/// As [`hash_file_blocks`] with an explicit block size. Each full
/// block of `block_size` bytes gets its own digest; the final block
/// covers only the bytes read.
pub fn hash_file_with_block_size(
    path: &Path,
    block_size: u64,
) -> Result<(String, Vec<String>), io::Error> {
    let mut file = File::open(path)?;
    let mut whole = blake3::Hasher::new();
    let mut block_hashes = Vec::new();
    let mut buf = vec![0u8; block_size as usize];

    loop {
        let n = read_full_block(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        whole.update(&buf[..n]);
        block_hashes.push(hex::encode(blake3::hash(&buf[..n]).as_bytes()));
        if n < buf.len() {
            break;
        }
    }

    Ok((hex::encode(whole.finalize().as_bytes()), block_hashes))
}

/// Read until `buf` is full or EOF; returns the byte count.
pub fn read_full_block(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn permission_bits(meta: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0o644
    }
}

/// A well-formed cache file is trusted as-is; staleness is the
/// user's responsibility.
fn load_cache(path: &Path) -> Option<Manifest> {
    let data = fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(manifest) => {
            debug!("loaded cached manifest from {}", path.display());
            Some(manifest)
        }
        Err(e) => {
            warn!("ignoring malformed manifest cache {}: {e}", path.display());
            None
        }
    }
}

fn store_cache(path: &Path, manifest: &Manifest) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(manifest).map_err(io::Error::other)?;
    let tmp = path.with_extension("tmp");
    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        io::Write::write_all(&mut file, &data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!("cached manifest at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_tree(root: &Path) {
        fs::write(root.join("file1.txt"), "Hello World").unwrap();
        fs::create_dir_all(root.join("subdir")).unwrap();
        fs::write(root.join("subdir/file2.go"), "package main").unwrap();
    }

    #[test]
    fn test_hashes_match_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, "Hello World").unwrap();

        let (whole, blocks) = hash_file_blocks(&path).unwrap();
        let expected = hex::encode(blake3::hash(b"Hello World").as_bytes());
        assert_eq!(whole, expected);
        // One short block covering the whole file.
        assert_eq!(blocks, vec![expected]);
    }

    #[test]
    fn test_block_partition_with_small_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..10u32).flat_map(|i| [i as u8; 4]).collect();
        fs::write(&path, &data).unwrap();

        let (whole, blocks) = hash_file_with_block_size(&path, 16).unwrap();
        assert_eq!(whole, hex::encode(blake3::hash(&data).as_bytes()));
        assert_eq!(blocks.len(), 3); // 16 + 16 + 8
        assert_eq!(blocks[0], hex::encode(blake3::hash(&data[..16]).as_bytes()));
        assert_eq!(blocks[2], hex::encode(blake3::hash(&data[32..]).as_bytes()));
    }

    #[test]
    fn test_empty_file_has_no_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();

        let (whole, blocks) = hash_file_blocks(&path).unwrap();
        assert_eq!(whole, hex::encode(blake3::hash(b"").as_bytes()));
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_single_file_manifest_uses_base_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, "Hello World").unwrap();

        let manifest = build_manifest(&path, ManifestOptions::default(), None).unwrap();
        assert_eq!(manifest.folder_name, "hello.txt");
        assert_eq!(manifest.total_size, 11);
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "hello.txt");
        assert_eq!(manifest.files[0].block_size, BLOCK_SIZE);
        assert!(!manifest.files[0].checksum.is_empty());
    }

    #[test]
    fn test_directory_manifest_walks_recursively() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir(&root).unwrap();
        write_tree(&root);

        let manifest = build_manifest(&root, ManifestOptions::default(), None).unwrap();
        assert_eq!(manifest.folder_name, "src");
        assert_eq!(manifest.total_size, 11 + 12);
        assert_eq!(manifest.files.len(), 2);
        assert!(manifest.find("file1.txt").is_some());
        assert!(manifest.find("subdir/file2.go").is_some());
        assert!(manifest.find("subdir\\file2.go").is_none());
    }

    #[test]
    fn test_skip_hash_leaves_checksums_empty() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir(&root).unwrap();
        write_tree(&root);

        let opts = ManifestOptions {
            skip_hash: true,
            ..Default::default()
        };
        let manifest = build_manifest(&root, opts, None).unwrap();
        for entry in &manifest.files {
            assert!(entry.checksum.is_empty());
            assert!(entry.block_hashes.is_empty());
        }
    }

    #[test]
    fn test_progress_fires_per_file() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir(&root).unwrap();
        write_tree(&root);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let cb = move |_path: &str, _size: u64| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        };
        build_manifest(&root, ManifestOptions::default(), Some(&cb)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_roundtrip_and_trust() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir(&root).unwrap();
        write_tree(&root);

        let opts = ManifestOptions {
            cache: true,
            skip_hash: false,
        };
        let first = build_manifest(&root, opts, None).unwrap();
        assert!(root.join(MANIFEST_CACHE_NAME).exists());

        // Mutate the tree; the cache is trusted and returned as-is.
        fs::write(root.join("file3.txt"), "new").unwrap();
        let second = build_manifest(&root, opts, None).unwrap();
        assert_eq!(second, first);

        // Without caching the new file shows up.
        let fresh = build_manifest(&root, ManifestOptions::default(), None).unwrap();
        assert_eq!(fresh.files.len(), 3);
    }

    #[test]
    fn test_cache_file_is_not_listed() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir(&root).unwrap();
        write_tree(&root);
        fs::write(root.join(MANIFEST_CACHE_NAME), "{}").unwrap();

        let manifest = build_manifest(&root, ManifestOptions::default(), None).unwrap();
        assert!(manifest.find(MANIFEST_CACHE_NAME).is_none());
        assert_eq!(manifest.files.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir(&root).unwrap();
        write_tree(&root);

        let opts = ManifestOptions {
            cache: true,
            skip_hash: false,
        };
        build_manifest(&root, opts, None).unwrap();
        let mode = fs::metadata(root.join(MANIFEST_CACHE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_legacy_block_size_fallback() {
        let entry = FileEntry {
            path: "x".into(),
            size: 10,
            mode: 0o644,
            checksum: String::new(),
            block_hashes: Vec::new(),
            block_size: 0,
        };
        assert_eq!(entry.effective_block_size(), LEGACY_BLOCK_SIZE);
    }
}
