//! Ping/pong keepalive loop. Sends a WebSocket ping every
//! `ping_interval` and treats an elapsed silence longer than
//! `pong_deadline` as a dead tunnel.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::writer::FrameSender;
use super::{CloseCause, CloseInfo};

pub fn spawn_ping_loop(
    frame_tx: FrameSender,
    last_activity: Arc<Mutex<Instant>>,
    ping_interval: Duration,
    pong_deadline: Duration,
    close_info: Arc<OnceLock<CloseInfo>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(ping_interval) => {}
                _ = cancel.cancelled() => break,
            }

            if frame_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                break;
            }

            let idle = last_activity.lock().unwrap().elapsed();
            if idle > pong_deadline {
                let _ = close_info.set(CloseInfo {
                    cause: CloseCause::PongTimeout,
                    code: None,
                    reason: format!("no pong within {:?} (idle {idle:?})", pong_deadline),
                });
                cancel.cancel();
                break;
            }
        }
        debug!("tunnel ping loop exiting");
    })
}
