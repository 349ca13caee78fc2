use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::broadcast::broadcast_roster;
use super::identity::Identity;
use super::protocol::ServerMessage;
use super::registry::{ChannelHandle, ConnectionId};
use super::state::PresenceState;
use super::store::{AttendanceLog, PersistentStore, Snapshot};
use crate::config::SessionConfig;
use crate::error::{AttendanceError, Result};

/// Owner of the shared presence domain.
///
/// Every mutation takes the single state lock and holds it through
/// persisting the snapshot and broadcasting the roster, so concurrent
/// sessions can neither lose updates nor observe interleaved rosters.
pub struct AttendanceServer {
    state: Mutex<PresenceState>,
    store: PersistentStore,
    config: SessionConfig,
    next_connection_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl AttendanceServer {
    /// Loads the previous snapshot, discards its presence data and writes the
    /// reconciled snapshot back. A failed write here is fatal.
    pub async fn start(store: PersistentStore, config: SessionConfig) -> Result<Arc<Self>> {
        let previous = store.load().await;
        if !previous.is_empty() {
            tracing::warn!(
                students_online = previous.students_online.len(),
                teachers_online = previous.teachers_online.len(),
                active_timers = previous.active_timers.len(),
                present = previous.present.len(),
                "Clearing presence state left over from previous run"
            );
        }

        let state = PresenceState::new();
        store.save(&state.snapshot()).await?;

        tracing::info!(
            snapshot = %store.snapshot_path().display(),
            attendance_log = %store.log_path().display(),
            "Attendance store ready"
        );

        Ok(Arc::new(Self {
            state: Mutex::new(state),
            store,
            config,
            next_connection_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn login(&self, identity: Identity, channel: ChannelHandle) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(AttendanceError::internal("server is shutting down"));
        }

        let mut state = self.state.lock().await;
        let connection_id = channel.id();
        let displaced = state.login(identity.clone(), channel, self.config.duplicate_login)?;

        if let Some(previous) = displaced {
            tracing::warn!(
                identity = %identity,
                previous_connection = previous.id(),
                connection_id,
                "Duplicate login, closing prior connection"
            );
            previous.close();
        }

        tracing::info!(identity = %identity, connection_id, "Logged in");
        self.commit(&mut state).await;
        Ok(())
    }

    pub async fn start_timer(&self, identity: &Identity, id: ConnectionId, username: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.authorize_timer(identity, id, username)?;

        if state.start_timer(username, Utc::now()) {
            tracing::info!(username = %username, "Timer started");
        } else {
            tracing::debug!(username = %username, "Timer already running");
        }

        self.commit(&mut state).await;
        Ok(())
    }

    /// Returns the logged completion time, or `None` if no timer was running
    pub async fn stop_timer(
        &self,
        identity: &Identity,
        id: ConnectionId,
        username: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut state = self.state.lock().await;
        state.authorize_timer(identity, id, username)?;

        let completed = state.stop_timer(username, Utc::now());
        match completed {
            Some(at) => {
                tracing::info!(username = %username, completed_at = %at, "Timer completed");
                if let Err(e) = self.store.append_log(username, at).await {
                    tracing::error!(username = %username, error = %e, "Failed to record attendance");
                }
            }
            None => tracing::debug!(username = %username, "Stop without running timer"),
        }

        self.commit(&mut state).await;
        Ok(completed)
    }

    /// Removes connection `id` if it still owns `identity`'s registry entry
    pub async fn disconnect(&self, identity: &Identity, id: ConnectionId) {
        let mut state = self.state.lock().await;
        if state.disconnect(identity, id) {
            tracing::info!(identity = %identity, connection_id = id, "Disconnected");
            self.commit(&mut state).await;
        }
    }

    /// Closes every registered channel and flushes the final snapshot
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let mut state = self.state.lock().await;
        let channels = state.close_all();
        for channel in &channels {
            channel.close();
        }
        self.persist(&state).await;

        tracing::info!(closed = channels.len(), "Closed all connections");
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn roster(&self) -> ServerMessage {
        self.state.lock().await.roster()
    }

    pub async fn attendance_log(&self) -> AttendanceLog {
        self.store.load_log().await
    }

    /// Persists and broadcasts the post-mutation state.
    ///
    /// Peers that cannot be reached are disconnected on the spot; if that
    /// changes the roster the new state is persisted and broadcast again.
    ///
    /// The state lock is held throughout. Targets are sent to concurrently, so
    /// a stalled peer costs each broadcast round at most one `send_timeout`.
    async fn commit(&self, state: &mut PresenceState) {
        loop {
            self.persist(state).await;

            let outcome = match broadcast_roster(state, self.config.send_timeout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode attendance update");
                    return;
                }
            };
            if outcome.failed.is_empty() {
                return;
            }

            let before = state.roster();
            for entry in outcome.failed {
                entry.channel.close();
                if state.disconnect(&entry.identity, entry.channel.id()) {
                    tracing::info!(identity = %entry.identity, "Dropped unreachable peer");
                }
            }

            if state.roster() == before {
                self.persist(state).await;
                return;
            }
        }
    }

    async fn persist(&self, state: &PresenceState) {
        if let Err(e) = self.store.save(&state.snapshot()).await {
            tracing::error!(error = %e, "Failed to persist snapshot");
        }
    }
}
