use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;

use super::session;
use crate::error::{AttendanceError, Result};
use crate::presence::AttendanceServer;

/// How long shutdown waits for session tasks before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind");
        AttendanceError::Network(e)
    })
}

/// Accepts connections and spawns one session task each until `shutdown`
/// resolves, then closes every registered channel and drains the sessions.
pub async fn serve<F>(listener: TcpListener, server: Arc<AttendanceServer>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "Attendance server listening");

    let mut sessions = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let server = server.clone();
                    sessions.spawn(session::handle_connection(stream, peer, server));
                }
                Err(e) => {
                    // Usually fd exhaustion; keep serving existing sessions
                    tracing::error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Session task failed");
                }
            }
        }
    }

    server.shutdown().await;

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = sessions.len(), "Sessions did not finish in time, aborting");
        sessions.abort_all();
    }

    tracing::info!("Attendance server stopped");
    Ok(())
}
