use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::peer::Peer;

/// Reconnection grace state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Connected,
    /// Connection lost; the peer is force-closed once `checks` exceeds the
    /// configured limit.
    PendingClose { checks: u8 },
}

/// Per-peer disconnect countdown. A transient socket drop must not destroy a
/// participant's media resources, so closing only happens after the
/// disconnect survives a number of periodic checks.
#[derive(Debug, Default)]
pub(crate) struct LivenessMonitor {
    task: Mutex<Option<JoinHandle<()>>>,
    checks: Arc<AtomicU8>,
    pending: Arc<AtomicBool>,
}

impl LivenessMonitor {
    /// Starts the countdown. Replaces any countdown already running, so there
    /// is a single live timer per peer.
    pub(crate) fn start(&self, peer: Arc<Peer>, interval: Duration, limit: u8) {
        self.cancel();
        self.checks.store(0, Ordering::SeqCst);
        self.pending.store(true, Ordering::SeqCst);

        let checks = self.checks.clone();
        let pending = self.pending.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if peer.closed() {
                    break;
                }
                if peer.connected() {
                    tracing::debug!("Peer {} connection restored", peer.id);
                    checks.store(0, Ordering::SeqCst);
                    pending.store(false, Ordering::SeqCst);
                    break;
                }
                let count = checks.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!("Peer {} disconnect check {}", peer.id, count);
                if count > limit {
                    tracing::info!("Peer {} did not return, closing", peer.id);
                    peer.close().await;
                    break;
                }
            }
        });

        let mut task = self.task.lock().unwrap();
        *task = Some(handle);
    }

    /// Stops the countdown unconditionally. Called on reconnect and on close.
    pub(crate) fn cancel(&self) {
        let mut task = self.task.lock().unwrap();
        if let Some(handle) = task.take() {
            handle.abort();
        }
        self.pending.store(false, Ordering::SeqCst);
        self.checks.store(0, Ordering::SeqCst);
    }

    pub(crate) fn state(&self) -> LivenessState {
        if self.pending.load(Ordering::SeqCst) {
            LivenessState::PendingClose {
                checks: self.checks.load(Ordering::SeqCst),
            }
        } else {
            LivenessState::Connected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::test_support::MockConnection;

    fn monitored_peer() -> (Arc<Peer>, Arc<MockConnection>) {
        let connection = MockConnection::new("c1");
        let peer = Peer::new(
            "peer-a".to_string(),
            connection.clone(),
            Arc::new(RoomConfig::default()),
        );
        (peer, connection)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn counts_up_and_closes_at_the_limit() {
        let (peer, connection) = monitored_peer();
        connection.drop_link();
        peer.handle_disconnect();
        assert_eq!(peer.liveness_state(), LivenessState::PendingClose { checks: 0 });
        // The monitor task has to reach its first sleep before time moves.
        settle().await;

        for expected in 1..=6u8 {
            tokio::time::advance(Duration::from_secs(20)).await;
            settle().await;
            assert_eq!(
                peer.liveness_state(),
                LivenessState::PendingClose { checks: expected }
            );
            assert!(!peer.closed());
        }

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert!(peer.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn restored_link_stops_the_countdown() {
        let (peer, connection) = monitored_peer();
        connection.drop_link();
        peer.handle_disconnect();
        settle().await;

        tokio::time::advance(Duration::from_secs(40)).await;
        settle().await;
        assert_eq!(peer.liveness_state(), LivenessState::PendingClose { checks: 2 });

        connection.restore_link();
        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(peer.liveness_state(), LivenessState::Connected);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert!(!peer.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_running_countdown() {
        let (peer, connection) = monitored_peer();
        connection.drop_link();
        peer.handle_disconnect();
        settle().await;

        tokio::time::advance(Duration::from_secs(100)).await;
        settle().await;
        assert_eq!(peer.liveness_state(), LivenessState::PendingClose { checks: 5 });

        // A second disconnect restarts the grace window from zero.
        peer.handle_disconnect();
        assert_eq!(peer.liveness_state(), LivenessState::PendingClose { checks: 0 });
        settle().await;
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert!(!peer.closed());
    }
}
