//! Ferry Core - shared types, wire protocol, and manifest builder
//!
//! This crate contains everything both transfer peers agree on: the
//! framed message format, the manifest data model and builder, path
//! validation, transfer codes, and persisted settings. It has no
//! dependency on networking code.

pub mod code;
pub mod config;
pub mod error;
pub mod manifest;
pub mod path;
pub mod protocol;

pub use config::{Config, NetConfig, TransferConfig};
pub use error::TransferError;
pub use manifest::{build_manifest, FileEntry, Manifest, ManifestOptions};
pub use protocol::{Frame, MessageKind};

/// Block granularity for per-block digests (16 MiB)
pub const BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// Block size assumed when an inbound manifest carries 0 (1 MiB)
pub const LEGACY_BLOCK_SIZE: u64 = 1024 * 1024;

/// Maximum size of a single framed message (100 MiB)
pub const MAX_MESSAGE_SIZE: usize = 100 << 20;

/// Intermediate buffer for file-data copy loops (256 KiB)
pub const COPY_BUF_SIZE: usize = 256 * 1024;

/// Buffered reader/writer capacity on the transfer stream (1 MiB)
pub const STREAM_BUF_SIZE: usize = 1024 * 1024;

/// Name of the cached manifest file inside a transfer root
pub const MANIFEST_CACHE_NAME: &str = ".manifest-cache";
