use std::path::PathBuf;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::CoordinatorEvent;
use crate::network::connection::ConnectionTask;
use crate::network::{ConnId, OUTBOUND_BUFFER};

/// Accept connections until `cancel` fires.
///
/// Every accepted socket is announced to the reactor with
/// `CoordinatorEvent::Connected` before its connection task starts reading,
/// so the reactor always knows a connection before it hears from it.
pub async fn serve(
    listener: TcpListener,
    events: mpsc::Sender<CoordinatorEvent>,
    spool_dir: PathBuf,
    cancel: CancellationToken,
) {
    let mut next_conn: ConnId = 1;

    match listener.local_addr() {
        Ok(addr) => tracing::info!(addr = %addr, "Listening for workers and clients"),
        Err(e) => tracing::warn!(error = %e, "Listener has no local address"),
    }

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let conn = next_conn;
        next_conn += 1;

        let (commands_tx, commands_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let connected = CoordinatorEvent::Connected {
            conn,
            peer,
            commands: commands_tx,
        };
        if events.send(connected).await.is_err() {
            tracing::info!("Coordinator stopped, closing listener");
            break;
        }

        tracing::info!(conn, peer = %peer, "Accepted connection");
        let task = ConnectionTask::new(
            conn,
            peer,
            events.clone(),
            commands_rx,
            spool_dir.clone(),
            cancel.child_token(),
        );
        tokio::spawn(task.run(stream));
    }

    tracing::info!("Listener stopped");
}
