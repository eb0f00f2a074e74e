//! Direct TCP transport
//!
//! A minimal [`Host`] over plain TCP: the sender listens and hands
//! accepted streams to the registered handler, the receiver dials a
//! known address. Streams open with a protocol-id preamble; a
//! mismatch is rejected before the transfer handshake ever runs.
//!
//! This transport stands in for an external DHT host: `advertise`
//! and `bootstrap` are local no-ops, and `find_peer` degenerates to
//! a reachability probe of the configured peer address.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::host::{protocol_id, Host, HostError, PeerId, StreamHandler};
use crate::stream::BoxStream;
use crate::DIAL_TIMEOUT;

pub struct TcpHost {
    local_addr: Option<SocketAddr>,
    target: Mutex<Option<SocketAddr>>,
    handler: Arc<Mutex<Option<StreamHandler>>>,
    connected_peer: Mutex<Option<PeerId>>,
    shutdown: watch::Sender<bool>,
}

impl TcpHost {
    /// Bind a listener and start accepting inbound streams
    /// (sender side).
    pub async fn listen(bind: SocketAddr) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let host = Arc::new(Self {
            local_addr: Some(local_addr),
            target: Mutex::new(None),
            handler: Arc::new(Mutex::new(None)),
            connected_peer: Mutex::new(None),
            shutdown,
        });

        info!("listening on {local_addr}");
        tokio::spawn(accept_loop(listener, host.handler.clone(), shutdown_rx));
        Ok(host)
    }

    /// A host that dials `target` (receiver side).
    pub fn dialer(target: SocketAddr) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            local_addr: None,
            target: Mutex::new(Some(target)),
            handler: Arc::new(Mutex::new(None)),
            connected_peer: Mutex::new(None),
            shutdown,
        })
    }

    /// The bound address when listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connected_peer(&self) -> Option<PeerId> {
        self.connected_peer.lock().clone()
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, HostError> {
        if *self.shutdown.borrow() {
            return Err(HostError::Closed);
        }
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| HostError::Dial(format!("{addr}: dial timed out")))?
            .map_err(|e| HostError::Dial(format!("{addr}: {e}")))?;
        Ok(stream)
    }
}

#[async_trait]
impl Host for TcpHost {
    /// Direct transport has no rendezvous substrate to join.
    async fn bootstrap(&self) -> Result<(), HostError> {
        debug!("direct transport, nothing to bootstrap");
        Ok(())
    }

    /// The listener is already reachable; announcing is a no-op.
    async fn advertise(&self, code: &str) -> Result<(), HostError> {
        debug!("advertising under {}", crate::host::rendezvous_key(code));
        Ok(())
    }

    /// Probe the configured peer address.
    async fn find_peer(&self, _code: &str) -> Result<PeerId, HostError> {
        let Some(target) = *self.target.lock() else {
            return Err(HostError::NotFound);
        };
        let probe = self.dial(target).await?;
        drop(probe);

        let peer = PeerId(target.to_string());
        *self.connected_peer.lock() = Some(peer.clone());
        Ok(peer)
    }

    async fn new_stream(&self, peer: &PeerId) -> Result<BoxStream, HostError> {
        let addr: SocketAddr = peer
            .0
            .parse()
            .map_err(|e| HostError::Dial(format!("bad peer address {peer}: {e}")))?;
        let mut stream = self.dial(addr).await?;
        send_preamble(&mut stream).await?;
        Ok(Box::new(stream))
    }

    fn set_stream_handler(&self, handler: StreamHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<Mutex<Option<StreamHandler>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let Some(handler) = handler.lock().clone() else {
                            debug!("no stream handler registered, dropping {peer_addr}");
                            continue;
                        };
                        tokio::spawn(async move {
                            match check_preamble(stream).await {
                                Ok(stream) => {
                                    handler(Box::new(stream), PeerId(peer_addr.to_string())).await;
                                }
                                Err(e) => warn!("rejected stream from {peer_addr}: {e}"),
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                debug!("listener shut down");
                return;
            }
        }
    }
}

/// Dialer side of the stream preamble: one length byte, then the
/// protocol id.
async fn send_preamble(stream: &mut TcpStream) -> Result<(), HostError> {
    let id = protocol_id();
    stream.write_all(&[id.len() as u8]).await?;
    stream.write_all(id.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Acceptor side: verify the protocol id before the handshake runs.
async fn check_preamble(mut stream: TcpStream) -> Result<TcpStream, HostError> {
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut id = vec![0u8; len[0] as usize];
    stream.read_exact(&mut id).await?;

    let offered = String::from_utf8_lossy(&id).into_owned();
    let expected = protocol_id();
    if offered != expected {
        return Err(HostError::Dial(format!(
            "protocol mismatch: expected {expected}, got {offered}"
        )));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn dial_and_accept_with_preamble() {
        let host = TcpHost::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = host.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel::<PeerId>(1);
        host.set_stream_handler(Arc::new(move |mut stream, peer| {
            let tx = tx.clone();
            Box::pin(async move {
                stream.write_all(b"hi").await.unwrap();
                stream.flush().await.unwrap();
                let _ = tx.send(peer).await;
            })
        }));

        let dialer = TcpHost::dialer(addr);
        let peer = dialer.find_peer("123-456").await.unwrap();
        let mut stream = dialer.new_stream(&peer).await.unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn bad_preamble_is_rejected() {
        let host = TcpHost::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = host.local_addr().unwrap();

        host.set_stream_handler(Arc::new(|mut stream, _peer| {
            Box::pin(async move {
                let _ = stream.write_all(b"hi").await;
            })
        }));

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&[9u8]).await.unwrap();
        raw.write_all(b"/wrong/id").await.unwrap();
        raw.flush().await.unwrap();

        // The acceptor drops the connection without invoking the
        // handler, so the read sees EOF rather than "hi".
        let mut buf = [0u8; 2];
        assert!(raw.read_exact(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn find_peer_without_target_fails() {
        let host = TcpHost::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(matches!(
            host.find_peer("123-456").await,
            Err(HostError::NotFound)
        ));
    }

    #[tokio::test]
    async fn closed_host_refuses_dials() {
        let host = TcpHost::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = host.local_addr().unwrap();
        let dialer = TcpHost::dialer(addr);
        dialer.close().await;
        assert!(matches!(
            dialer.find_peer("123-456").await,
            Err(HostError::Closed)
        ));
    }
}
