//! Local TCP listener. Exactly one attachment at a time: the engine
//! calls `accept_one` only while idle, and while a client is attached
//! spawns `reject_extra` so any further connection attempt is accepted
//! and immediately RST'd rather than left queued.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;

pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(port: u16) -> Result<Self, EngineError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let inner = TcpListener::bind(addr).await.map_err(EngineError::Bind)?;
        let local_addr = inner.local_addr().map_err(EngineError::Bind)?;
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the single attachment slot to be taken, or for
    /// `cancel` to fire. Returns `None` on cancellation.
    pub async fn accept_one(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<(TcpStream, SocketAddr)>, EngineError> {
        tokio::select! {
            result = self.inner.accept() => {
                let (stream, peer) = result.map_err(EngineError::Bind)?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                }
                debug!(peer = %peer, "local client attached");
                Ok(Some((stream, peer)))
            }
            _ = cancel.cancelled() => Ok(None),
        }
    }

    /// Accept and immediately reject any connection attempt made while
    /// a client is already attached, closing it with `SO_LINGER(0)` so
    /// the peer sees a reset rather than a clean close.
    pub async fn reject_extra(&self, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                result = self.inner.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            warn!(peer = %peer, "rejecting second local client: already attached");
                            reset(stream);
                        }
                        Err(e) => {
                            warn!(error = %e, "accept error while rejecting extra clients");
                        }
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

fn reset(stream: TcpStream) {
    let sock_ref = socket2::SockRef::from(&stream);
    if let Err(e) = sock_ref.set_linger(Some(std::time::Duration::ZERO)) {
        debug!(error = %e, "failed to set SO_LINGER(0) on rejected connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn accept_one_returns_connection() {
        let listener = Listener::bind(0).await.unwrap();
        let addr = listener.local_addr();
        let cancel = CancellationToken::new();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _peer) = listener.accept_one(&cancel).await.unwrap().unwrap();
        drop(stream);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn accept_one_returns_none_on_cancel() {
        let listener = Listener::bind(0).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = listener.accept_one(&cancel).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn reject_extra_resets_connections() {
        let listener = Listener::bind(0).await.unwrap();
        let addr = listener.local_addr();
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        let reject_task = tokio::spawn(async move { listener.reject_extra(&cancel_clone).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let result = stream.read(&mut buf).await;
        assert!(matches!(result, Ok(0)) || result.is_err());

        cancel.cancel();
        reject_task.await.unwrap();
    }
}
