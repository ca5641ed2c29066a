//! Command-line surface. One flag per field, each readable from the
//! matching environment variable via `#[derive(Parser)]` + `env = "..."`.

use clap::{Args, Parser, Subcommand};

/// Local TCP-to-WebSocket bridge for a cloud remote-access tunnel.
#[derive(Parser, Debug, Clone)]
#[command(name = "c8ylp", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub net: NetArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the bridge until stopped.
    Server {
        /// Target device identifier (external id known to the cloud).
        device: String,
    },
    /// Run the bridge, then spawn a child ssh client against the local port.
    Connect {
        #[command(subcommand)]
        target: ConnectTarget,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConnectTarget {
    /// Spawn `ssh` pointed at the local bridge port.
    Ssh {
        /// Target device identifier (external id known to the cloud).
        device: String,
        /// Extra arguments passed through to the ssh client.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        ssh_args: Vec<String>,
    },
}

/// The network/auth/tuning flags shared by both subcommands.
#[derive(Args, Debug, Clone)]
pub struct NetArgs {
    /// Cloud base URL, e.g. https://tenant.cumulocity.com
    #[arg(long, env = "C8Y_HOST")]
    pub host: Option<String>,

    /// Tenant id.
    #[arg(long, env = "C8Y_TENANT")]
    pub tenant: Option<String>,

    /// Username.
    #[arg(long, env = "C8Y_USER")]
    pub user: Option<String>,

    /// Password.
    #[arg(long, env = "C8Y_PASSWORD")]
    pub password: Option<String>,

    /// Pre-obtained bearer token (skips login when set).
    #[arg(long, env = "C8Y_TOKEN")]
    pub token: Option<String>,

    /// Second-factor (TFA) code.
    #[arg(long, env = "C8Y_TFA_CODE")]
    pub tfa_code: Option<String>,

    /// Local port to bind (0 = OS-chosen).
    #[arg(long, env = "C8YLP_PORT", default_value_t = 2222)]
    pub port: u16,

    /// WebSocket ping interval, seconds.
    #[arg(long, env = "C8YLP_PING_INTERVAL", default_value_t = 30)]
    pub ping_interval: u64,

    /// Max WebSocket frame / pump buffer size, bytes.
    #[arg(long, env = "C8YLP_TCP_SIZE", default_value_t = 16 * 1024)]
    pub tcp_size: usize,

    /// Per-attachment idle timeout, seconds (0 = disabled).
    #[arg(long, env = "C8YLP_TCP_TIMEOUT", default_value_t = 0)]
    pub tcp_timeout: u64,

    /// Skip TLS certificate verification on the tunnel connection.
    #[arg(long, env = "C8YLP_SSL_IGNORE_VERIFY", default_value_t = false)]
    pub ssl_ignore_verify: bool,

    /// Max idle-reconnect attempts (0 = unlimited).
    #[arg(long, env = "C8YLP_RECONNECTS", default_value_t = 0)]
    pub reconnects: u32,

    /// Dotenv file to load (lowest-precedence source).
    #[arg(long, env = "C8YLP_ENV_FILE", default_value = ".env")]
    pub env_file: String,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Ambient logging flags, independent of the bridge's own settings.
#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    /// Emit structured JSON log lines instead of plain text.
    #[arg(long, env = "C8YLP_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Also write logs to this file (rotated daily), in addition to stderr.
    #[arg(long, env = "C8YLP_LOG_FILE")]
    pub log_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_subcommand_parses_device() {
        let cli = Cli::parse_from(["c8ylp", "--host", "https://t.example.com", "server", "my-device"]);
        match cli.command {
            Command::Server { device } => assert_eq!(device, "my-device"),
            _ => panic!("expected Server subcommand"),
        }
        assert_eq!(cli.net.port, 2222);
    }

    #[test]
    fn connect_ssh_collects_trailing_args() {
        let cli = Cli::parse_from([
            "c8ylp",
            "--host",
            "https://t.example.com",
            "connect",
            "ssh",
            "my-device",
            "-l",
            "admin",
        ]);
        match cli.command {
            Command::Connect {
                target: ConnectTarget::Ssh { device, ssh_args },
            } => {
                assert_eq!(device, "my-device");
                assert_eq!(ssh_args, vec!["-l".to_string(), "admin".to_string()]);
            }
            _ => panic!("expected Connect/Ssh subcommand"),
        }
    }
}
