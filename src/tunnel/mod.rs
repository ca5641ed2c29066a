//! WebSocket tunnel: open/send/recv/ping_loop/close.
//!
//! One tunnel owns three tasks — a writer, a reader and a ping loop —
//! all sharing a single `CancellationToken` so a failure in any one of
//! them tears down the other two.

mod connect;
mod heartbeat;
mod reader;
mod writer;

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;

/// Default silence tolerated before a missing pong kills the tunnel:
/// two missed ping intervals, giving a 30s/60s default pair.
const PONG_DEADLINE_FACTOR: u32 = 2;

/// What kind of event ended the tunnel, independent of the free-text
/// `reason` — lets callers recover a typed `TunnelError` via
/// `CloseInfo::as_tunnel_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer sent a WebSocket Close frame.
    PeerClosed,
    /// The underlying connection errored or ended without a Close frame.
    ReadError,
    /// No pong was seen within the configured deadline.
    PongTimeout,
    /// The peer sent a frame type the wire protocol forbids.
    ProtocolError,
}

/// Why the tunnel ended, for logging and for the engine's reconnect
/// decision. Set exactly once, by whichever task notices first.
#[derive(Debug, Clone)]
pub struct CloseInfo {
    pub cause: CloseCause,
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    /// Recover the typed error this close corresponds to, so callers
    /// that only see `CloseInfo` (logging, the engine's pump) can still
    /// report the same error kind `Tunnel::open`/`send` would have
    /// returned had the failure happened synchronously.
    pub fn as_tunnel_error(&self) -> TunnelError {
        match self.cause {
            CloseCause::PongTimeout => TunnelError::PongTimeout,
            CloseCause::ProtocolError => TunnelError::Protocol(self.reason.clone()),
            CloseCause::PeerClosed | CloseCause::ReadError => TunnelError::Closed,
        }
    }
}

/// Inbound events surfaced to the proxy engine.
#[derive(Debug)]
pub enum TunnelEvent {
    Data(Vec<u8>),
}

pub struct Tunnel {
    frame_tx: writer::FrameSender,
    event_rx: mpsc::Receiver<TunnelEvent>,
    close_info: Arc<OnceLock<CloseInfo>>,
    cancel: CancellationToken,
    writer_handle: JoinHandle<()>,
    reader_handle: JoinHandle<()>,
    ping_handle: JoinHandle<()>,
}

impl Tunnel {
    /// Dial the tunnel URL and bring up the writer/reader/ping-loop
    /// tasks. Returns once the WebSocket handshake has completed.
    pub async fn open(
        url: &str,
        auth_header: &str,
        ping_interval: Duration,
        danger_ignore_verify: bool,
    ) -> Result<Self, TunnelError> {
        let ws_stream = connect::connect(url, auth_header, danger_ignore_verify).await?;
        let (sink, stream) = StreamExt::split(ws_stream);

        let (frame_tx, writer_handle) = writer::spawn_writer(sink);
        let (event_tx, event_rx) = mpsc::channel(64);
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let close_info = Arc::new(OnceLock::new());
        let cancel = CancellationToken::new();

        let reader_handle = reader::spawn_reader(
            stream,
            event_tx,
            frame_tx.clone(),
            Arc::clone(&last_activity),
            Arc::clone(&close_info),
            cancel.clone(),
        );

        let pong_deadline = ping_interval * PONG_DEADLINE_FACTOR;
        let ping_handle = heartbeat::spawn_ping_loop(
            frame_tx.clone(),
            last_activity,
            ping_interval,
            pong_deadline,
            Arc::clone(&close_info),
            cancel.clone(),
        );

        Ok(Self {
            frame_tx,
            event_rx,
            close_info,
            cancel,
            writer_handle,
            reader_handle,
            ping_handle,
        })
    }

    /// Send one opaque chunk of TCP payload over the tunnel.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(self.dead_tunnel_error());
        }
        self.frame_tx
            .send(Message::Binary(data.into()))
            .await
            .map_err(|_| self.dead_tunnel_error())
    }

    /// The typed error matching why this tunnel died, falling back to
    /// the generic `Closed` if no task has recorded a cause yet.
    fn dead_tunnel_error(&self) -> TunnelError {
        self.close_info()
            .map(|info| info.as_tunnel_error())
            .unwrap_or(TunnelError::Closed)
    }

    /// Receive the next inbound chunk. `None` means the tunnel ended —
    /// call `close_info()` to find out why.
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        self.event_rx.recv().await
    }

    pub fn close_info(&self) -> Option<CloseInfo> {
        self.close_info.get().cloned()
    }

    /// A cancellation token that fires when the tunnel dies for any
    /// reason (peer close, pong timeout, write failure). The proxy
    /// engine's duplex pump shares this so both pump halves stop
    /// together.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Gracefully close: send a Close frame and wait for all three
    /// tasks to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let _ = self.frame_tx.send(Message::Close(None)).await;
        drop(self.frame_tx);
        let _ = tokio::join!(self.writer_handle, self.reader_handle, self.ping_handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;

    async fn echo_server(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut stream) = StreamExt::split(ws);
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Binary(data) => {
                    if sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Message::Ping(payload) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn open_send_recv_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(echo_server(listener));

        let url = format!("ws://{addr}");
        let mut tunnel = Tunnel::open(&url, "Bearer test-token", Duration::from_secs(30), false)
            .await
            .unwrap();

        tunnel.send(b"hello tunnel".to_vec()).await.unwrap();
        match tunnel.recv().await {
            Some(TunnelEvent::Data(data)) => assert_eq!(data, b"hello tunnel"),
            other => panic!("unexpected event: {other:?}"),
        }

        tunnel.close().await;
    }

    #[tokio::test]
    async fn recv_returns_none_on_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(None).await.ok();
        });

        let url = format!("ws://{addr}");
        let mut tunnel = Tunnel::open(&url, "Bearer test-token", Duration::from_secs(30), false)
            .await
            .unwrap();

        let event = tunnel.recv().await;
        assert!(event.is_none(), "expected tunnel to end on peer close");
        let info = tunnel.close_info().expect("close info set");
        assert_eq!(info.cause, CloseCause::PeerClosed);
    }

    #[tokio::test]
    async fn text_frame_is_treated_as_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.send(Message::Text("not allowed on this wire".into())).await;
        });

        let url = format!("ws://{addr}");
        let mut tunnel = Tunnel::open(&url, "Bearer test-token", Duration::from_secs(30), false)
            .await
            .unwrap();

        let event = tunnel.recv().await;
        assert!(event.is_none(), "expected tunnel to end on a text frame");
        let info = tunnel.close_info().expect("close info set");
        assert_eq!(info.cause, CloseCause::ProtocolError);
        assert!(matches!(info.as_tunnel_error(), TunnelError::Protocol(_)));
    }

    #[tokio::test]
    async fn missing_pong_times_out_the_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut stream) = StreamExt::split(ws);
            // Drain incoming frames but never answer a ping with a pong.
            while let Some(Ok(msg)) = stream.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let url = format!("ws://{addr}");
        let mut tunnel = Tunnel::open(&url, "Bearer test-token", Duration::from_millis(20), false)
            .await
            .unwrap();

        let event = tunnel.recv().await;
        assert!(event.is_none(), "expected tunnel to end on missed pong");
        let info = tunnel.close_info().expect("close info set");
        assert_eq!(info.cause, CloseCause::PongTimeout);
        assert!(matches!(info.as_tunnel_error(), TunnelError::PongTimeout));
    }
}
