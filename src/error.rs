//! Typed error taxonomy plus the exit-code mapping main() uses.

use std::process::ExitCode;

/// Credential/config resolution failures. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("C8Y_HOST is required (set --host, C8Y_HOST, or C8YLP_HOST)")]
    MissingHost,
    #[error("invalid host URL: {0}")]
    InvalidHost(#[from] url::ParseError),
    #[error("failed to read env file {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenvy::Error,
    },
}

/// Cloud REST failures (login / device resolution / tunnel lookup).
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("authentication failed")]
    Auth,
    #[error("server requires a second factor (TFA)")]
    TfaRequired,
    #[error("device not found")]
    NotFound,
    #[error("more than one device matched")]
    Ambiguous,
    #[error("cloud request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("cloud request timed out")]
    Timeout,
}

/// WebSocket tunnel failures.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("transport error connecting tunnel: {0}")]
    Transport(#[from] std::io::Error),
    #[error("WebSocket handshake rejected: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("tunnel handshake timed out")]
    ConnectTimeout,
    #[error("no pong received within deadline")]
    PongTimeout,
    #[error("unexpected frame on tunnel: {0}")]
    Protocol(String),
    #[error("tunnel is closed")]
    Closed,
}

/// Top-level error the engine's supervisor reasons about.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("failed to bind local listener: {0}")]
    Bind(std::io::Error),
    #[error("invalid invocation: {0}")]
    Invocation(String),
}

impl EngineError {
    /// Map to a stable process exit code a caller can branch on.
    pub fn exit_code(&self) -> ExitCode {
        let code: u8 = match self {
            EngineError::Invocation(_) => 2,
            EngineError::Cloud(CloudError::Auth | CloudError::TfaRequired) => 3,
            EngineError::Cloud(CloudError::NotFound | CloudError::Ambiguous) => 4,
            EngineError::Bind(_) => 6,
            _ => 1,
        };
        ExitCode::from(code)
    }
}

/// Exit code used when an attached tunnel fails: the session does not
/// reconnect, it simply ends with this fixed code.
pub const EXIT_TUNNEL_CLOSED_WHILE_ATTACHED: u8 = 5;
