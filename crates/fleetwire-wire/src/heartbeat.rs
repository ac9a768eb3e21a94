//! Heartbeat monitor: evicts peers that have gone silent.
//!
//! The monitor runs as a background tokio task on a fixed interval,
//! independent of traffic. Each tick it checks every session's
//! `last_heartbeat`; any session silent for longer than the timeout is
//! removed with reason "heartbeat timeout", which closes its transport and
//! fires the disconnect notification through the owning [`SessionHandler`].

use std::sync::Arc;
use std::time::Duration;

use fleetwire_types::HeartbeatSettings;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::listener::{remove_session, SessionHandler};
use crate::message::PeerRole;
use crate::registry::Registry;

/// Close reason used for evictions.
pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Liveness of one session at the time of a check.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatStatus {
    pub peer_id: String,
    pub session_token: String,
    /// Time since the last message from this peer.
    pub silent_for: Duration,
    /// Whether the silence exceeds the timeout.
    pub expired: bool,
}

/// Check every session in `registry` as of `now`.
///
/// Pure: nothing is removed.
pub fn check_sessions(
    registry: &Registry,
    now: Instant,
    timeout: Duration,
) -> Vec<HeartbeatStatus> {
    registry
        .list()
        .into_iter()
        .map(|s| {
            let silent_for = now.saturating_duration_since(s.last_heartbeat());
            HeartbeatStatus {
                peer_id: s.peer_id,
                session_token: s.session_token,
                silent_for,
                expired: silent_for > timeout,
            }
        })
        .collect()
}

/// Remove every expired session of `role`. Returns the evicted peer ids.
pub fn evict_expired<H: SessionHandler + ?Sized>(
    handler: &H,
    role: PeerRole,
    now: Instant,
    timeout: Duration,
) -> Vec<String> {
    let mut evicted = Vec::new();
    for status in check_sessions(handler.registry(role), now, timeout) {
        if !status.expired {
            continue;
        }
        warn!(
            role = %role,
            peer_id = %status.peer_id,
            silent_secs = status.silent_for.as_secs_f64(),
            "Peer missed heartbeats"
        );
        if remove_session(
            handler,
            role,
            &status.peer_id,
            &status.session_token,
            HEARTBEAT_TIMEOUT_REASON,
        ) {
            evicted.push(status.peer_id);
        }
    }
    evicted
}

/// Run the monitor for every role of `handler` until `shutdown` turns `true`.
pub fn spawn_monitor<H: SessionHandler + ?Sized>(
    handler: Arc<H>,
    settings: HeartbeatSettings,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = settings.interval();
        let timeout = settings.timeout();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = timeout.as_secs(),
            "Heartbeat monitor started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for role in handler.roles() {
                        let evicted = evict_expired(handler.as_ref(), *role, now, timeout);
                        if !evicted.is_empty() {
                            debug!(role = %role, count = evicted.len(), "Evicted silent peers");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Heartbeat monitor stopped");
    })
}
