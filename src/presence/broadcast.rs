use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use super::protocol::{encode_frame, ServerMessage};
use super::registry::ConnectionEntry;
use super::state::PresenceState;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    /// Targets that could not be reached in time; treat as disconnected
    pub failed: Vec<ConnectionEntry>,
}

/// Pushes the current roster to every registered connection.
///
/// The frame is encoded once so every target receives identical bytes. Sends
/// run concurrently, each bounded by `send_timeout`; one stalled peer only
/// costs its own timeout.
pub async fn broadcast_roster(state: &PresenceState, send_timeout: Duration) -> Result<BroadcastOutcome> {
    let roster = state.roster();
    broadcast_to(state.registry().broadcast_targets(), &roster, send_timeout).await
}

pub async fn broadcast_to(
    targets: Vec<ConnectionEntry>,
    message: &ServerMessage,
    send_timeout: Duration,
) -> Result<BroadcastOutcome> {
    let frame: Arc<str> = Arc::from(encode_frame(message)?);

    let sends = targets.into_iter().map(|entry| {
        let frame = frame.clone();
        async move {
            let result = entry.channel.send_timeout(frame, send_timeout).await;
            (entry, result)
        }
    });

    let mut outcome = BroadcastOutcome::default();
    for (entry, result) in join_all(sends).await {
        match result {
            Ok(()) => outcome.delivered += 1,
            Err(e) => {
                tracing::warn!(
                    identity = %entry.identity,
                    error = %e,
                    "Failed to deliver attendance update"
                );
                outcome.failed.push(entry);
            }
        }
    }

    tracing::debug!(
        delivered = outcome.delivered,
        failed = outcome.failed.len(),
        "Broadcast attendance update"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicateLoginPolicy;
    use crate::presence::identity::Identity;
    use crate::presence::registry::test_channel;
    use chrono::Utc;

    #[tokio::test]
    async fn test_every_target_receives_identical_frame() {
        let mut state = PresenceState::new();
        let (alice, mut alice_rx, _c1) = test_channel(1, 4);
        let (smith, mut smith_rx, _c2) = test_channel(2, 4);
        state
            .login(Identity::student("alice"), alice, DuplicateLoginPolicy::Replace)
            .unwrap();
        state
            .login(Identity::teacher("smith"), smith, DuplicateLoginPolicy::Replace)
            .unwrap();
        state.start_timer("alice", Utc::now());
        state.stop_timer("alice", Utc::now());

        let outcome = broadcast_roster(&state, Duration::from_millis(50)).await.unwrap();
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.failed.is_empty());

        let to_alice = alice_rx.recv().await.unwrap();
        let to_smith = smith_rx.recv().await.unwrap();
        assert_eq!(to_alice, to_smith);

        let message: ServerMessage = serde_json::from_str(to_alice.trim_end()).unwrap();
        assert_eq!(
            message,
            ServerMessage::UpdateAttendance {
                data: vec!["alice".to_string()],
                active: vec![],
            }
        );
    }

    #[tokio::test]
    async fn test_stalled_target_does_not_block_others() {
        let mut state = PresenceState::new();
        let (stalled, _stalled_rx, _c1) = test_channel(1, 1);
        let (healthy, mut healthy_rx, _c2) = test_channel(2, 4);
        let (gone, gone_rx, _c3) = test_channel(3, 4);
        drop(gone_rx);

        state
            .login(Identity::student("stalled"), stalled.clone(), DuplicateLoginPolicy::Replace)
            .unwrap();
        state
            .login(Identity::teacher("healthy"), healthy, DuplicateLoginPolicy::Replace)
            .unwrap();
        state
            .login(Identity::student("gone"), gone, DuplicateLoginPolicy::Replace)
            .unwrap();

        // Fill the stalled peer's queue
        stalled
            .send_timeout(Arc::from("pending"), Duration::from_millis(10))
            .await
            .unwrap();

        let outcome = broadcast_roster(&state, Duration::from_millis(50)).await.unwrap();
        assert_eq!(outcome.delivered, 1);

        let mut failed: Vec<String> = outcome
            .failed
            .iter()
            .map(|entry| entry.identity.username.clone())
            .collect();
        failed.sort();
        assert_eq!(failed, vec!["gone", "stalled"]);

        assert!(healthy_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_no_targets() {
        let state = PresenceState::new();
        let outcome = broadcast_roster(&state, Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome.delivered, 0);
        assert!(outcome.failed.is_empty());
    }
}
