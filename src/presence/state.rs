use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use super::identity::{Identity, Role};
use super::protocol::ServerMessage;
use super::registry::{ChannelHandle, ConnectionId, ConnectionRegistry, Registration};
use super::store::Snapshot;
use crate::config::DuplicateLoginPolicy;
use crate::error::{AttendanceError, Result};

/// All mutable presence state. Callers serialize access through one lock.
///
/// Invariant: every key of `active_timers` and every member of `present` is
/// the username of a student currently held in `registry`.
#[derive(Debug, Default)]
pub struct PresenceState {
    registry: ConnectionRegistry,
    /// username -> when the running timer was started
    active_timers: BTreeMap<String, DateTime<Utc>>,
    present: BTreeSet<String>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Registers a logged-in identity. Returns a displaced channel, if any,
    /// which the caller must close.
    ///
    /// A replaced student keeps their running timer and present mark: the new
    /// connection is the same student.
    pub fn login(
        &mut self,
        identity: Identity,
        channel: ChannelHandle,
        policy: DuplicateLoginPolicy,
    ) -> Result<Option<ChannelHandle>> {
        match self.registry.register(identity, channel, policy)? {
            Registration::Added => Ok(None),
            Registration::Replaced(previous) => Ok(Some(previous)),
        }
    }

    /// Checks that connection `id`, logged in as `identity`, may drive the
    /// timer of `username`
    pub fn authorize_timer(&self, identity: &Identity, id: ConnectionId, username: &str) -> Result<()> {
        if !identity.is_student()
            || identity.username != username
            || self.registry.connection_id(identity) != Some(id)
        {
            return Err(AttendanceError::IdentityMismatch {
                session: identity.to_string(),
                requested: username.to_string(),
            });
        }
        Ok(())
    }

    /// Returns false if the timer was already running
    pub fn start_timer(&mut self, username: &str, now: DateTime<Utc>) -> bool {
        if self.active_timers.contains_key(username) {
            return false;
        }
        self.active_timers.insert(username.to_string(), now);
        true
    }

    /// Completes a running timer, marking the student present.
    ///
    /// Returns the completion time, never earlier than the start, or `None`
    /// when no timer was running.
    pub fn stop_timer(&mut self, username: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let started = self.active_timers.remove(username)?;
        self.present.insert(username.to_string());
        Some(now.max(started))
    }

    /// Drops connection `id` for `identity`, discarding a running timer
    /// without credit. Returns whether anything changed.
    pub fn disconnect(&mut self, identity: &Identity, id: ConnectionId) -> bool {
        if !self.registry.unregister(identity, id) {
            return false;
        }

        if identity.role == Role::Student {
            if self.active_timers.remove(&identity.username).is_some() {
                tracing::info!(
                    username = %identity.username,
                    "Discarded in-progress timer on disconnect"
                );
            }
            self.present.remove(&identity.username);
        }
        true
    }

    /// Empties the registry, returning every channel for closing
    pub fn close_all(&mut self) -> Vec<ChannelHandle> {
        self.active_timers.clear();
        self.present.clear();
        self.registry.drain()
    }

    pub fn is_active(&self, username: &str) -> bool {
        self.active_timers.contains_key(username)
    }

    pub fn is_present(&self, username: &str) -> bool {
        self.present.contains(username)
    }

    pub fn active(&self) -> Vec<String> {
        self.active_timers.keys().cloned().collect()
    }

    pub fn present(&self) -> Vec<String> {
        self.present.iter().cloned().collect()
    }

    /// The roster pushed to every client
    pub fn roster(&self) -> ServerMessage {
        ServerMessage::UpdateAttendance {
            data: self.present(),
            active: self.active(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            students_online: self.registry.online(Role::Student),
            teachers_online: self.registry.online(Role::Teacher),
            active_timers: self.active(),
            present: self.present(),
        }
    }
}
