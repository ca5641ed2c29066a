//! `connect ssh` subcommand: wait for the bridge to bind, then spawn
//! a child `ssh` pointed at the local port and wait for it to exit.

use std::process::Command;

use tracing::info;

/// Spawn `ssh -p <port> localhost <extra args>` and block until it exits.
pub fn spawn_and_wait(port: u16, extra_args: &[String]) -> std::io::Result<std::process::ExitStatus> {
    info!(port, "spawning ssh");
    Command::new("ssh")
        .arg("-p")
        .arg(port.to_string())
        .arg("localhost")
        .args(extra_args)
        .status()
}
