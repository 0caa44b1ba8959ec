//! Process signal handling.

use tokio::signal;
use tracing::{error, info};

/// Resolve on SIGINT or SIGTERM.
///
/// If a handler cannot be installed the failure is logged and that signal is
/// ignored; the other one still triggers shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(
                target = "rasterd::shutdown",
                error = %err,
                "Failed to install CTRL+C handler"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(
                    target = "rasterd::shutdown",
                    error = %err,
                    "Failed to install SIGTERM handler"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!(target = "rasterd::shutdown", signal = "SIGINT", "Shutdown requested"),
        () = terminate => info!(target = "rasterd::shutdown", signal = "SIGTERM", "Shutdown requested"),
    }
}
