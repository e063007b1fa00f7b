use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::session;
use crate::coordination::CoordinationService;

/// Accepts session connections until `shutdown` fires. Each connection runs
/// on its own tracked task.
pub async fn serve(
    listener: TcpListener,
    service: Arc<CoordinationService>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                tracing::debug!("Connection from {}", remote);
                let _ = stream.set_nodelay(true);
                tracker.spawn(session::handle_connection(
                    service.clone(),
                    stream,
                    remote,
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
            }
        }
    }

    tracing::info!("Session listener stopped");
}
