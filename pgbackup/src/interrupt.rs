//! SIGINT and SIGTERM handling.
//!
//! A signal cancels the shared token; long operations notice it between
//! files and leave their records in ERROR.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// SIGTERM is hooked before this returns, SIGINT once the task first runs.
pub fn cancel_on_signal(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = terminate.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => info!("Received SIGINT, interrupting"),
                Err(e) => {
                    warn!("Failed to listen for SIGINT: {}", e);
                    return;
                }
            },
            _ = terminate => info!("Received SIGTERM, interrupting"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    }))
}
