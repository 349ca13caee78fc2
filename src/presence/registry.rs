use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use super::identity::{Identity, Role};
use crate::config::DuplicateLoginPolicy;
use crate::error::{AttendanceError, Result};

pub type ConnectionId = u64;

/// Sending side of one live connection.
///
/// Frames are queued on a bounded channel drained by the connection's session
/// task; `close` wakes that task so it tears the socket down.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<str>>,
    closer: Arc<Notify>,
}

impl ChannelHandle {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<Arc<str>>, closer: Arc<Notify>) -> Self {
        Self { id, sender, closer }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame, giving up after `timeout` if the peer is not draining
    pub async fn send_timeout(&self, frame: Arc<str>, timeout: Duration) -> Result<()> {
        self.sender
            .send_timeout(frame, timeout)
            .await
            .map_err(|e| AttendanceError::PeerUnreachable(format!("connection {}: {}", self.id, e)))
    }

    pub fn close(&self) {
        self.closer.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub identity: Identity,
    pub channel: ChannelHandle,
}

#[derive(Debug)]
pub enum Registration {
    Added,
    /// A prior live channel for the same identity was displaced and must be closed
    Replaced(ChannelHandle),
}

/// In-memory map of logged-in identities to their live channels.
///
/// Never persisted; starts empty on every run.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<Identity, ChannelHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        identity: Identity,
        channel: ChannelHandle,
        policy: DuplicateLoginPolicy,
    ) -> Result<Registration> {
        match self.entries.get(&identity) {
            Some(existing) if existing.id() == channel.id() => Ok(Registration::Added),
            Some(_) if policy == DuplicateLoginPolicy::Reject => {
                Err(AttendanceError::DuplicateIdentity(identity.to_string()))
            }
            _ => match self.entries.insert(identity, channel) {
                Some(previous) => Ok(Registration::Replaced(previous)),
                None => Ok(Registration::Added),
            },
        }
    }

    /// Removes the entry only if it still belongs to connection `id`.
    ///
    /// A connection that was replaced by a newer login for the same identity
    /// must not evict its successor.
    pub fn unregister(&mut self, identity: &Identity, id: ConnectionId) -> bool {
        match self.entries.get(identity) {
            Some(channel) if channel.id() == id => {
                self.entries.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn broadcast_targets(&self) -> Vec<ConnectionEntry> {
        self.entries
            .iter()
            .map(|(identity, channel)| ConnectionEntry {
                identity: identity.clone(),
                channel: channel.clone(),
            })
            .collect()
    }

    /// Connection currently owning `identity`
    pub fn connection_id(&self, identity: &Identity) -> Option<ConnectionId> {
        self.entries.get(identity).map(ChannelHandle::id)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Sorted usernames currently online with `role`
    pub fn online(&self, role: Role) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .filter(|identity| identity.role == role)
            .map(|identity| identity.username.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, returning the channels so the caller can close them
    pub fn drain(&mut self) -> Vec<ChannelHandle> {
        self.entries.drain().map(|(_, channel)| channel).collect()
    }
}

#[cfg(test)]
pub(crate) fn test_channel(id: ConnectionId, capacity: usize) -> (ChannelHandle, mpsc::Receiver<Arc<str>>, Arc<Notify>) {
    let (tx, rx) = mpsc::channel(capacity);
    let closer = Arc::new(Notify::new());
    (ChannelHandle::new(id, tx, closer.clone()), rx, closer)
}
