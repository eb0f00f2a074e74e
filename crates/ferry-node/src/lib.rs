//! Ferry Node - transfer engines and rendezvous abstraction
//!
//! This crate drives the wire protocol defined in `ferry-core`: the
//! sender and receiver engines, framed stream I/O with deadlines, the
//! optional gzip layer, and the `Host` seam behind which a rendezvous
//! transport (DHT, direct TCP, in-memory) plugs in.

use std::time::Duration;

pub mod compress;
pub mod host;
pub mod receiver;
pub mod sender;
pub mod stream;
pub mod tcp;

pub use host::{rendezvous_key, Host, HostError, PeerId};
pub use receiver::Receiver;
pub use sender::Sender;
pub use stream::{AsyncStream, BoxStream};

use ferry_core::Manifest;

/// Deadline for each control-message read and each bulk data write
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a single peer dial
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for one DHT search pass
pub const FIND_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for each bootstrap dial
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Courtesy wait after `Complete` for the receiver's buffers to drain
pub const COMPLETE_LINGER: Duration = Duration::from_secs(10);

/// Re-advertise period while a sender is willing to serve
pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(30);

/// Receiver-side search policy: attempts and spacing
pub const FIND_ATTEMPTS: u32 = 60;
pub const FIND_SPACING: Duration = Duration::from_millis(500);

/// Fired when a file begins: `(path, index, total)`
pub type StartFileFn = dyn Fn(&str, usize, usize) + Send + Sync;

/// Fired after each copied chunk: `(path, bytes_done, total_bytes)`
pub type ProgressFn = dyn Fn(&str, u64, u64) + Send + Sync;

/// Asks the front-end to accept an inbound manifest
pub type ConfirmFn = dyn Fn(&Manifest) -> bool + Send + Sync;
