//! Tunnel connect: TCP dial, TLS, WebSocket upgrade.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::error::TunnelError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME_SIZE: usize = 1 << 20;

pub type TunnelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial `url`, present `auth_header` as the Authorization header, and
/// complete the WebSocket upgrade. `danger_ignore_verify` disables TLS
/// certificate validation (`--ssl-ignore-verify`).
pub async fn connect(
    url: &str,
    auth_header: &str,
    danger_ignore_verify: bool,
) -> Result<TunnelStream, TunnelError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TunnelError::Protocol(e.to_string()))?;
    request.headers_mut().insert(
        "Authorization",
        http::HeaderValue::from_str(auth_header)
            .map_err(|e| TunnelError::Protocol(e.to_string()))?,
    );

    let uri: http::Uri = url
        .parse()
        .map_err(|_| TunnelError::Protocol("invalid tunnel URL".into()))?;
    let host = uri
        .host()
        .ok_or_else(|| TunnelError::Protocol("missing host in tunnel URL".into()))?;
    let is_tls = uri.scheme_str() == Some("wss");
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let tcp_stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TunnelError::ConnectTimeout)??;

    configure_socket(&tcp_stream);

    let connector = if is_tls {
        Some(Connector::Rustls(Arc::new(build_tls_config(
            danger_ignore_verify,
        ))))
    } else {
        None
    };

    let ws_config = WebSocketConfig {
        max_frame_size: Some(MAX_FRAME_SIZE),
        max_message_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    };

    let (ws_stream, _response) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::client_async_tls_with_config(request, tcp_stream, Some(ws_config), connector),
    )
    .await
    .map_err(|_| TunnelError::ConnectTimeout)??;

    Ok(ws_stream)
}

fn configure_socket(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
    }
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive on tunnel socket");
    }
}

fn build_tls_config(danger_ignore_verify: bool) -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
    let mut config = builder.with_no_client_auth();

    if danger_ignore_verify {
        warn!("TLS certificate verification disabled for the tunnel connection");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerification));
    }

    config
}

#[derive(Debug)]
struct NoCertVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
