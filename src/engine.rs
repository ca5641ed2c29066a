//! Proxy engine: the state machine tying together the cloud client,
//! the tunnel and the local listener, plus the duplex pump and the
//! idle-reconnect policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::CloudClient;
use crate::config::Credentials;
use crate::error::EngineError;
use crate::listener::Listener;
use crate::tunnel::Tunnel;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const DEVICE_ID_TYPE: &str = "c8y_Serial";

/// The lifecycle states of one bridge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Auth,
    Resolving,
    TunnelConnecting,
    TunnelOpenIdle,
    TunnelOpenAttached,
    Draining,
    Closed,
}

/// Bookkeeping for one session, kept mostly for logging and tests.
pub struct Session {
    pub device: String,
    pub state: SessionState,
    pub reconnect_attempts: u32,
    pub started_at: Instant,
}

impl Session {
    fn new(device: String) -> Self {
        Self {
            device,
            state: SessionState::Init,
            reconnect_attempts: 0,
            started_at: Instant::now(),
        }
    }

    fn transition(&mut self, state: SessionState) {
        debug!(device = %self.device, from = ?self.state, to = ?state, "session state transition");
        self.state = state;
    }
}

/// How the engine's `run` ended.
pub enum EngineOutcome {
    /// Shutdown was requested and the session wound down cleanly.
    ShutdownClean,
    /// The tunnel died while a local client was attached; this ends
    /// the session instead of reconnecting.
    TunnelClosedWhileAttached,
}

enum PumpOutcome {
    LocalEof,
    TunnelClosed,
    IdleTimeout,
}

/// Run one bridge session against `device` until shutdown or a fatal
/// error. Blocks for the lifetime of the process (minus signal wait).
pub async fn run(
    creds: Credentials,
    device: String,
    shutdown: CancellationToken,
) -> Result<EngineOutcome, EngineError> {
    let mut session = Session::new(device.clone());

    let mut cloud = CloudClient::new(&creds);

    session.transition(SessionState::Auth);
    let auth_header = cloud.login().await?;

    session.transition(SessionState::Resolving);
    let device_id = cloud.resolve_device(&device, DEVICE_ID_TYPE).await?;
    info!(device = %device, "device resolved");

    let listener = Arc::new(Listener::bind(creds.port).await?);
    info!(addr = %listener.local_addr(), "local listener bound");

    'connect: loop {
        if shutdown.is_cancelled() {
            session.transition(SessionState::Draining);
            break;
        }

        session.transition(SessionState::TunnelConnecting);
        let url = match cloud.tunnel_url(&device_id).await {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "failed to look up tunnel URL, retrying");
                if !backoff_and_continue(&mut session, &shutdown, creds.reconnect_limit()).await {
                    session.transition(SessionState::Draining);
                    break;
                }
                continue;
            }
        };

        let mut tunnel = match Tunnel::open(
            &url,
            auth_header.expose(),
            creds.ping_interval,
            creds.ssl_ignore_verify,
        )
        .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "tunnel connect failed, will retry");
                if !backoff_and_continue(&mut session, &shutdown, creds.reconnect_limit()).await {
                    session.transition(SessionState::Draining);
                    break;
                }
                continue;
            }
        };

        session.reconnect_attempts = 0;

        // Attach cycle: the same tunnel serves any number of successive
        // local attachments until it dies or shutdown fires.
        loop {
            session.transition(SessionState::TunnelOpenIdle);

            let cancel = tunnel.cancellation();
            let accepted = tokio::select! {
                result = listener.accept_one(&cancel) => Some(result),
                _ = shutdown.cancelled() => None,
            };

            let Some(accept_result) = accepted else {
                tunnel.close().await;
                session.transition(SessionState::Draining);
                break 'connect;
            };

            let stream = match accept_result? {
                Some((stream, _peer)) => stream,
                None => break, // tunnel died while idle, nobody ever attached
            };

            session.transition(SessionState::TunnelOpenAttached);
            let reject_cancel = cancel.clone();
            let reject_listener = Arc::clone(&listener);
            let reject_handle =
                tokio::spawn(async move { reject_listener.reject_extra(&reject_cancel).await });

            let outcome = pump(stream, &mut tunnel, creds.tcp_size, creds.tcp_timeout).await;
            reject_handle.abort();

            match outcome {
                PumpOutcome::LocalEof => {
                    debug!(device = %device, "local client disconnected");
                }
                PumpOutcome::IdleTimeout => {
                    debug!(device = %device, "attachment idle timeout");
                    tunnel.close().await;
                    break;
                }
                PumpOutcome::TunnelClosed => {
                    let error = tunnel.close_info().map(|info| info.as_tunnel_error());
                    warn!(device = %device, error = ?error, "tunnel closed while attached");
                    return Ok(EngineOutcome::TunnelClosedWhileAttached);
                }
            }
        }

        if shutdown.is_cancelled() {
            session.transition(SessionState::Draining);
            break;
        }

        if !backoff_and_continue(&mut session, &shutdown, creds.reconnect_limit()).await {
            session.transition(SessionState::Draining);
            break;
        }
    }

    session.transition(SessionState::Closed);
    Ok(EngineOutcome::ShutdownClean)
}

/// Sleep for the next backoff delay, racing shutdown. Returns `false`
/// if shutdown fired, or if the attempt budget (`reconnect_limit`,
/// `None` meaning unlimited) is exhausted, and the caller should stop
/// retrying.
async fn backoff_and_continue(
    session: &mut Session,
    shutdown: &CancellationToken,
    reconnect_limit: Option<u32>,
) -> bool {
    session.reconnect_attempts += 1;

    if let Some(limit) = reconnect_limit {
        if session.reconnect_attempts > limit {
            info!(
                device = %session.device,
                limit,
                "reconnect attempt budget exhausted, giving up"
            );
            return false;
        }
    }

    let delay = next_delay(session.reconnect_attempts);
    info!(
        device = %session.device,
        attempt = session.reconnect_attempts,
        delay_ms = delay.as_millis(),
        "reconnecting tunnel"
    );
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.cancelled() => false,
    }
}

fn next_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(8);
    let delay = BACKOFF_INITIAL.saturating_mul(1u32 << shift);
    delay.min(BACKOFF_CAP)
}

/// Shuttle bytes between the attached local TCP client and the tunnel
/// until one side ends. `idle_timeout` of zero disables the idle cutoff.
async fn pump(
    stream: TcpStream,
    tunnel: &mut Tunnel,
    tcp_size: usize,
    idle_timeout: Duration,
) -> PumpOutcome {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; tcp_size];
    let has_idle_timeout = !idle_timeout.is_zero();

    loop {
        let idle_sleep = async {
            if has_idle_timeout {
                tokio::time::sleep(idle_timeout).await
            } else {
                std::future::pending().await
            }
        };

        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => return PumpOutcome::LocalEof,
                    Ok(n) => {
                        if let Err(e) = tunnel.send(buf[..n].to_vec()).await {
                            debug!(error = %e, "tunnel send failed");
                            return PumpOutcome::TunnelClosed;
                        }
                    }
                }
            }
            event = tunnel.recv() => {
                match event {
                    Some(crate::tunnel::TunnelEvent::Data(data)) => {
                        if write_half.write_all(&data).await.is_err() {
                            return PumpOutcome::LocalEof;
                        }
                    }
                    None => return PumpOutcome::TunnelClosed,
                }
            }
            _ = idle_sleep => return PumpOutcome::IdleTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(next_delay(1), Duration::from_secs(1));
        assert_eq!(next_delay(2), Duration::from_secs(2));
        assert_eq!(next_delay(3), Duration::from_secs(4));
        assert_eq!(next_delay(6), Duration::from_secs(30));
        assert_eq!(next_delay(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn reconnect_limit_of_zero_stops_after_first_attempt() {
        let mut session = Session::new("dev".to_string());
        let shutdown = CancellationToken::new();
        let continued = backoff_and_continue(&mut session, &shutdown, Some(0)).await;
        assert!(!continued);
        assert_eq!(session.reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn reconnect_limit_stops_once_attempts_exceed_it() {
        let mut session = Session::new("dev".to_string());
        session.reconnect_attempts = 3; // already at the configured limit
        let shutdown = CancellationToken::new();
        let continued = backoff_and_continue(&mut session, &shutdown, Some(3)).await;
        assert!(!continued);
        assert_eq!(session.reconnect_attempts, 4);
    }

    #[tokio::test]
    async fn reconnect_limit_none_never_exhausts_the_budget() {
        let mut session = Session::new("dev".to_string());
        session.reconnect_attempts = 1_000_000;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // No limit is set, so only the shutdown cancellation stops the loop.
        let continued = backoff_and_continue(&mut session, &shutdown, None).await;
        assert!(!continued);
    }

    async fn echo_server(listener: tokio::net::TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut stream) = ws.split();
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                WsMessage::Binary(data) => {
                    if sink.send(WsMessage::Binary(data)).await.is_err() {
                        break;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn pump_forwards_bytes_until_local_eof() {
        let ws_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        tokio::spawn(echo_server(ws_listener));

        let mut tunnel = Tunnel::open(
            &format!("ws://{ws_addr}"),
            "Bearer test",
            Duration::from_secs(30),
            false,
        )
        .await
        .unwrap();

        let tcp_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = tcp_listener.local_addr().unwrap();
        let mut client = TcpStream::connect(tcp_addr).await.unwrap();
        let (server_side, _) = tcp_listener.accept().await.unwrap();

        let pump_task = tokio::spawn(async move {
            let outcome = pump(server_side, &mut tunnel, 4096, Duration::ZERO).await;
            (outcome, tunnel)
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        let (outcome, tunnel) = pump_task.await.unwrap();
        assert!(matches!(outcome, PumpOutcome::LocalEof));
        tunnel.close().await;
    }
}
