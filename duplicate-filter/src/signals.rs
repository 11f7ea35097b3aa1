use tokio::signal::unix::SignalKind;
use tracing::{error, info};

/// Resolve on the first SIGINT or SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler, only SIGINT stops the service: {e}");
            if let Err(e) = ctrl_c.await {
                error!("Failed to listen for SIGINT: {e}");
            }
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
