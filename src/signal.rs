//! Signal / lifetime controller: turns Ctrl+C or SIGTERM into a single
//! cancellation that every long-lived task shares, via a
//! `CancellationToken` that composes directly with the tunnel's own
//! cancellation.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct SignalController {
    token: CancellationToken,
}

impl SignalController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown directly, without waiting for an OS signal.
    /// Used by tests and by any future interactive "stop" command.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Wait for Ctrl+C or SIGTERM, then cancel the shared token.
    pub async fn wait_for_signal(&self) {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        self.token.cancel();
    }
}

impl Default for SignalController {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_cancels_the_shared_token() {
        let controller = SignalController::new();
        let token = controller.token();
        assert!(!token.is_cancelled());
        controller.stop();
        assert!(token.is_cancelled());
    }
}
