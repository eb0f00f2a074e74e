//! Rendezvous abstraction
//!
//! The engines never talk to a concrete transport; they consume a
//! [`Host`]: advertise/find/dial plus stream-handler registration.
//! Any transport satisfying it works: the in-tree TCP transport,
//! an in-memory pair in tests, or an external DHT host.
//!
//! Peers meet under a deterministic rendezvous key derived from the
//! shared code; the code itself never appears on the rendezvous
//! substrate.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use ferry_core::code;

use crate::stream::BoxStream;
use crate::{ADVERTISE_INTERVAL, FIND_ATTEMPTS, FIND_SPACING};

/// Namespace prefix for rendezvous keys.
pub const RENDEZVOUS_NAMESPACE: &str = "ferry-rendezvous";

/// Stream protocol identifier; a mismatch is a non-retryable
/// incompatibility at the transport layer.
pub fn protocol_id() -> String {
    format!("/ferry/transfer/{}", env!("CARGO_PKG_VERSION"))
}

/// Derive the rendezvous key for a transfer code.
///
/// The code is normalized (separators stripped) and hashed with
/// SHA-256; the first 8 bytes in hex, under the namespace, form the
/// key. Pure and deterministic.
pub fn rendezvous_key(transfer_code: &str) -> String {
    let digest = Sha256::digest(code::normalize(transfer_code).as_bytes());
    format!("{RENDEZVOUS_NAMESPACE}/{}", hex::encode(&digest[..8]))
}

/// Opaque peer identity assigned by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("no peers found")]
    NotFound,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("host closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sender-side callback invoked once per accepted inbound stream.
pub type StreamHandler =
    Arc<dyn Fn(BoxStream, PeerId) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Minimal rendezvous/dial interface the engines depend on.
///
/// A host lives for one transfer attempt; [`Host::close`] cancels
/// everything it spawned. Implementations back `find_peer` with a
/// 30 s search budget and 5 s per candidate dial, and `bootstrap`
/// with parallel 30 s dials to the transport's well-known peers.
#[async_trait]
pub trait Host: Send + Sync {
    /// Join the rendezvous substrate. Succeeds when at least one
    /// bootstrap connection establishes.
    async fn bootstrap(&self) -> Result<(), HostError>;

    /// Announce under the rendezvous key for `code`. Callers
    /// re-advertise every [`ADVERTISE_INTERVAL`] for as long as the
    /// node is willing to receive.
    async fn advertise(&self, code: &str) -> Result<(), HostError>;

    /// Search for an advertised peer and connect to it, ignoring
    /// self and candidates without addresses.
    async fn find_peer(&self, code: &str) -> Result<PeerId, HostError>;

    /// Open a transfer stream to a connected peer on
    /// [`protocol_id`].
    async fn new_stream(&self, peer: &PeerId) -> Result<BoxStream, HostError>;

    /// Register the sender-side inbound stream handler.
    fn set_stream_handler(&self, handler: StreamHandler);

    /// Cancel in-flight operations and shut the host down.
    async fn close(&self);
}

/// Re-publish the advertisement every [`ADVERTISE_INTERVAL`] until
/// the shutdown channel fires. The first publication is immediate.
pub async fn advertise_loop(host: &dyn Host, code: &str, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(ADVERTISE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = host.advertise(code).await {
                    warn!("advertise failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                debug!("advertise loop stopped");
                return;
            }
        }
    }
}

/// Receiver-side search: up to [`FIND_ATTEMPTS`] passes with
/// [`FIND_SPACING`] between them.
pub async fn search_for_peer(host: &dyn Host, code: &str) -> Result<PeerId, HostError> {
    for attempt in 1..=FIND_ATTEMPTS {
        match host.find_peer(code).await {
            Ok(peer) => {
                info!("found sender {peer} on attempt {attempt}");
                return Ok(peer);
            }
            Err(HostError::Closed) => return Err(HostError::Closed),
            Err(e) => debug!("find attempt {attempt}/{FIND_ATTEMPTS} failed: {e}"),
        }
        tokio::time::sleep(FIND_SPACING).await;
    }
    Err(HostError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_known_vectors() {
        assert_eq!(
            rendezvous_key("123-456"),
            "ferry-rendezvous/8d969eef6ecad3c2"
        );
        assert_eq!(
            rendezvous_key("654-321"),
            "ferry-rendezvous/481f6cc0511143cc"
        );
    }

    #[test]
    fn rendezvous_is_deterministic() {
        assert_eq!(rendezvous_key("123-456"), rendezvous_key("123-456"));
        assert_ne!(rendezvous_key("123-456"), rendezvous_key("654-321"));
    }

    #[test]
    fn rendezvous_normalizes_separators() {
        assert_eq!(rendezvous_key("123-456"), rendezvous_key("123456"));
        assert_eq!(rendezvous_key(" 123-456 "), rendezvous_key("123456"));
    }

    #[test]
    fn protocol_id_carries_version() {
        let id = protocol_id();
        assert!(id.starts_with("/ferry/transfer/"));
        assert_eq!(id, format!("/ferry/transfer/{}", env!("CARGO_PKG_VERSION")));
    }
}
