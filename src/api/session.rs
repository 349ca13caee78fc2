use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::error::{AttendanceError, Result};
use crate::presence::{
    AttendanceServer, ChannelHandle, ClientMessage, ConnectionId, Identity, Inbound, LineFramer,
};

/// Queued outbound frames per connection before broadcasts start timing out
const OUTBOUND_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(Identity),
    Closed,
}

/// Protocol state of one connection, independent of the socket
pub struct Session {
    channel: ChannelHandle,
    server: Arc<AttendanceServer>,
    state: SessionState,
}

impl Session {
    pub fn new(channel: ChannelHandle, server: Arc<AttendanceServer>) -> Self {
        Self {
            channel,
            server,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Handles one decoded frame. An error means the connection must close.
    pub async fn handle_frame(&mut self, frame: &str) -> Result<()> {
        let inbound = Inbound::parse(frame)?;

        let identity = match self.state.clone() {
            SessionState::Closed => return Err(AttendanceError::protocol("session already closed")),
            SessionState::Unauthenticated => {
                return match inbound {
                    Inbound::Message(ClientMessage::Login { username, role }) => {
                        self.login(&username, &role).await
                    }
                    Inbound::Message(other) => {
                        Err(AttendanceError::NotAuthenticated(other.action().to_string()))
                    }
                    Inbound::Unknown(action) => Err(AttendanceError::NotAuthenticated(action)),
                };
            }
            SessionState::Authenticated(identity) => identity,
        };

        let result = match inbound {
            Inbound::Message(ClientMessage::Login { .. }) => {
                tracing::warn!(identity = %identity, "Ignoring repeated login");
                Ok(())
            }
            Inbound::Message(ClientMessage::StartTimer { username }) => {
                self.server.start_timer(&identity, self.channel.id(), &username).await
            }
            Inbound::Message(ClientMessage::StopTimer { username }) => {
                self.server
                    .stop_timer(&identity, self.channel.id(), &username)
                    .await
                    .map(|_| ())
            }
            Inbound::Unknown(action) => {
                tracing::warn!(identity = %identity, action = %action, "Ignoring unknown action");
                Ok(())
            }
        };

        match result {
            Err(e) if !e.is_fatal_to_connection() => {
                tracing::warn!(identity = %identity, error = %e, "Rejected request");
                Ok(())
            }
            other => other,
        }
    }

    async fn login(&mut self, username: &str, role: &str) -> Result<()> {
        let identity = Identity::parse(username, role)?;
        self.server.login(identity.clone(), self.channel.clone()).await?;
        self.state = SessionState::Authenticated(identity);
        Ok(())
    }

    /// Leaves the registry if logged in. Safe to call more than once.
    pub async fn close(&mut self) {
        if let SessionState::Authenticated(identity) =
            std::mem::replace(&mut self.state, SessionState::Closed)
        {
            self.server.disconnect(&identity, self.channel.id()).await;
        }
    }
}

/// Runs one client connection until it closes, errors, or is closed by the server
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, server: Arc<AttendanceServer>) {
    let connection_id = server.next_connection_id();
    let send_timeout = server.config().send_timeout;
    let (tx, rx) = mpsc::channel::<Arc<str>>(OUTBOUND_CAPACITY);
    let closer = Arc::new(Notify::new());
    let channel = ChannelHandle::new(connection_id, tx, closer.clone());

    let mut framer = LineFramer::new(server.config().max_frame_bytes);
    let mut session = Session::new(channel, server);
    let (mut reader, writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];

    tracing::info!(connection_id, peer = %peer, "Connection accepted");

    // Outbound frames drain independently of frame dispatch
    let writer_task = tokio::spawn(write_frames(writer, rx, closer.clone(), send_timeout, connection_id));

    let reason: &str = 'conn: loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(connection_id, error = %e, "Read failed");
                        break 'conn "read error";
                    }
                };

                if n == 0 {
                    match framer.finish() {
                        Ok(Some(frame)) => {
                            if let Err(e) = session.handle_frame(&frame).await {
                                tracing::warn!(connection_id, error = %e, "Protocol error");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(connection_id, error = %e, "Protocol error"),
                    }
                    break 'conn "end of stream";
                }

                framer.extend(&buf[..n]);
                loop {
                    match framer.next_frame() {
                        Ok(Some(frame)) => {
                            if let Err(e) = session.handle_frame(&frame).await {
                                tracing::warn!(connection_id, error = %e, "Protocol error, dropping connection");
                                break 'conn "protocol error";
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(connection_id, error = %e, "Protocol error, dropping connection");
                            break 'conn "protocol error";
                        }
                    }
                }
            }
            _ = closer.notified() => break 'conn "closed",
        }
    };

    session.close().await;
    writer_task.abort();
    let _ = writer_task.await;
    tracing::info!(connection_id, peer = %peer, reason, "Connection closed");
}

/// Writes queued frames to the socket until the queue closes or a write fails.
///
/// A failed or timed out write wakes the read loop so the connection closes.
async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Arc<str>>,
    closer: Arc<Notify>,
    send_timeout: Duration,
    connection_id: ConnectionId,
) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(send_timeout, writer.write_all(frame.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id, error = %e, "Write failed");
                closer.notify_one();
                break;
            }
            Err(_) => {
                tracing::warn!(connection_id, "Write timed out");
                closer.notify_one();
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::presence::PersistentStore;

    async fn server_and_session(dir: &tempfile::TempDir) -> (Arc<AttendanceServer>, Session, mpsc::Receiver<Arc<str>>) {
        let store = PersistentStore::new(dir.path().join("data.json"), dir.path().join("log.json"));
        let server = AttendanceServer::start(store, SessionConfig::default()).await.unwrap();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let channel = ChannelHandle::new(server.next_connection_id(), tx, Arc::new(Notify::new()));
        let session = Session::new(channel, server.clone());
        (server, session, rx)
    }

    #[tokio::test]
    async fn test_login_transitions_to_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut session, mut rx) = server_and_session(&dir).await;

        session
            .handle_frame(r#"{"action":"login","username":"alice","role":"student"}"#)
            .await
            .unwrap();
        assert_eq!(session.state(), &SessionState::Authenticated(Identity::student("alice")));
        assert_eq!(server.snapshot().await.students_online, vec!["alice"]);
        assert!(rx.recv().await.unwrap().contains("update_attendance"));
    }

    #[tokio::test]
    async fn test_invalid_role_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut session, mut rx) = server_and_session(&dir).await;

        let err = session
            .handle_frame(r#"{"action":"login","username":"alice","role":"admin"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::InvalidRole(_)));
        assert_eq!(session.state(), &SessionState::Unauthenticated);
        assert!(server.snapshot().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timer_before_login_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut session, _rx) = server_and_session(&dir).await;

        let err = session
            .handle_frame(r#"{"action":"start_timer","username":"alice"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::NotAuthenticated(action) if action == "start_timer"));
        assert!(server.snapshot().await.active_timers.is_empty());

        assert!(session.handle_frame(r#"{"action":"wave"}"#).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_action_after_login_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, mut session, _rx) = server_and_session(&dir).await;
        session
            .handle_frame(r#"{"action":"login","username":"smith","role":"teacher"}"#)
            .await
            .unwrap();

        session.handle_frame(r#"{"action":"wave"}"#).await.unwrap();
        session
            .handle_frame(r#"{"action":"login","username":"other","role":"teacher"}"#)
            .await
            .unwrap();
        assert_eq!(session.state(), &SessionState::Authenticated(Identity::teacher("smith")));
    }

    #[tokio::test]
    async fn test_foreign_timer_request_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut session, _rx) = server_and_session(&dir).await;
        session
            .handle_frame(r#"{"action":"login","username":"alice","role":"student"}"#)
            .await
            .unwrap();

        session
            .handle_frame(r#"{"action":"start_timer","username":"bob"}"#)
            .await
            .unwrap();
        assert!(server.snapshot().await.active_timers.is_empty());
    }

    #[tokio::test]
    async fn test_close_unregisters_once() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut session, _rx) = server_and_session(&dir).await;
        session
            .handle_frame(r#"{"action":"login","username":"alice","role":"student"}"#)
            .await
            .unwrap();
        session
            .handle_frame(r#"{"action":"start_timer","username":"alice"}"#)
            .await
            .unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), &SessionState::Closed);
        assert!(server.snapshot().await.is_empty());
        assert!(session.handle_frame(r#"{"action":"wave"}"#).await.is_err());
    }
}
