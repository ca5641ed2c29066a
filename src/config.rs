//! Credential store. Resolves `Credentials` from CLI flags, process
//! environment and an optional dotenv file, in that precedence order:
//! a value already set by a higher-precedence source is never
//! clobbered by a lower one.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::cli::NetArgs;
use crate::error::ConfigError;

/// A secret value that never prints itself in `{:?}` or logs.
#[derive(Clone)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Resolved, validated settings for one bridge session.
///
/// Built once at startup; every field below survives for the lifetime
/// of the process. Never logged in full (see `Debug`).
pub struct Credentials {
    pub host: Url,
    pub tenant: Option<String>,
    pub user: Option<String>,
    pub password: Option<SecretToken>,
    pub token: Option<SecretToken>,
    pub tfa_code: Option<SecretToken>,
    pub port: u16,
    pub ping_interval: Duration,
    pub tcp_size: usize,
    pub tcp_timeout: Duration,
    pub ssl_ignore_verify: bool,
    pub reconnects: u32,
    pub verbose: u8,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host.as_str())
            .field("tenant", &self.tenant)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("tfa_code", &self.tfa_code.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .field("ping_interval", &self.ping_interval)
            .field("tcp_size", &self.tcp_size)
            .field("tcp_timeout", &self.tcp_timeout)
            .field("ssl_ignore_verify", &self.ssl_ignore_verify)
            .field("reconnects", &self.reconnects)
            .finish()
    }
}

impl Credentials {
    /// Has a usable bearer token already, or needs to log in first.
    pub fn needs_login(&self) -> bool {
        self.token.is_none()
    }

    pub fn reconnect_limit(&self) -> Option<u32> {
        if self.reconnects == 0 {
            None
        } else {
            Some(self.reconnects)
        }
    }
}

/// Load `env_file` into the process environment, without overwriting
/// anything already set by the real environment or the shell. Missing
/// file is not an error: the default `.env` simply may not exist.
pub fn load_env_file(env_file: &str) -> Result<(), ConfigError> {
    match dotenvy::from_filename(env_file) {
        Ok(_) => Ok(()),
        Err(dotenvy::Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ConfigError::EnvFile {
            path: env_file.to_string(),
            source,
        }),
    }
}

/// Resolve a `Credentials` snapshot from parsed CLI args. `dotenvy`
/// has already had a chance to populate `std::env` by the time this
/// runs (see `load_env_file`), so clap's own `env = "..."` lookups
/// already reflect the full CLI > env > file precedence chain; this
/// function only adds validation on top.
pub fn resolve(net: &NetArgs) -> Result<Credentials, ConfigError> {
    let host_str = net.host.as_deref().ok_or(ConfigError::MissingHost)?;
    let host = Url::parse(host_str)?;

    Ok(Credentials {
        host,
        tenant: net.tenant.clone(),
        user: net.user.clone(),
        password: net.password.clone().map(SecretToken::new),
        token: net.token.clone().map(SecretToken::new),
        tfa_code: net.tfa_code.clone().map(SecretToken::new),
        port: net.port,
        ping_interval: Duration::from_secs(net.ping_interval),
        tcp_size: net.tcp_size,
        tcp_timeout: Duration::from_secs(net.tcp_timeout),
        ssl_ignore_verify: net.ssl_ignore_verify,
        reconnects: net.reconnects,
        verbose: net.verbose,
    })
}
