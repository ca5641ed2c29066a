//! Dedicated WebSocket writer task.
//!
//! Every outbound frame — data, ping, pong, close — goes through this
//! one task over an mpsc channel, so the sink is never written to from
//! two places at once and frames can't interleave mid-write.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

pub type FrameSender = mpsc::Sender<Message>;

pub fn spawn_writer<S>(mut sink: S) -> (FrameSender, JoinHandle<()>)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(64);

    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                error!(error = %e, "failed to write to tunnel socket");
                break;
            }
            if is_close {
                break;
            }
        }
        debug!("tunnel writer exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
