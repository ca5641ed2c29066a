//! Tunnel read side: routes inbound WebSocket frames to data events,
//! answers pings, and records the close reason the peer sends.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::writer::FrameSender;
use super::{CloseCause, CloseInfo, TunnelEvent};

#[allow(clippy::too_many_arguments)]
pub fn spawn_reader<S>(
    mut stream: S,
    event_tx: mpsc::Sender<TunnelEvent>,
    frame_tx: FrameSender,
    last_activity: Arc<Mutex<Instant>>,
    close_info: Arc<OnceLock<CloseInfo>>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                item = stream.next() => item,
                _ = cancel.cancelled() => break,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!(error = %e, "tunnel read error");
                    let _ = close_info.set(CloseInfo {
                        cause: CloseCause::ReadError,
                        code: None,
                        reason: format!("read error: {e}"),
                    });
                    break;
                }
                None => {
                    let _ = close_info.set(CloseInfo {
                        cause: CloseCause::ReadError,
                        code: None,
                        reason: "connection dropped".to_string(),
                    });
                    break;
                }
            };

            *last_activity.lock().unwrap() = Instant::now();

            match msg {
                Message::Binary(data) => {
                    if event_tx.send(TunnelEvent::Data(data.into())).await.is_err() {
                        break;
                    }
                }
                Message::Ping(payload) => {
                    if frame_tx.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Message::Pong(_) => {
                    // liveness already recorded above
                }
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    debug!(?code, %reason, "tunnel closed by peer");
                    let _ = close_info.set(CloseInfo {
                        cause: CloseCause::PeerClosed,
                        code,
                        reason,
                    });
                    break;
                }
                Message::Text(text) => {
                    warn!(%text, "protocol error: text frame on tunnel");
                    let _ = close_info.set(CloseInfo {
                        cause: CloseCause::ProtocolError,
                        code: None,
                        reason: "unexpected text frame".to_string(),
                    });
                    break;
                }
                Message::Frame(_) => {
                    warn!("ignoring raw frame message");
                }
            }
        }

        cancel.cancel();
        debug!("tunnel reader exiting");
    })
}
