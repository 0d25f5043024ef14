//! Remote subscriber sessions.
//!
//! One [`Session`] per remote subscriber that joined this sender's outbound
//! stream: its granted demand, its liveness, its cancellation flag. All
//! mutation is confined to the service-dispatch task; everyone else reads a
//! [`DemandSnapshot`] published through a `watch` channel, so the sender
//! task never touches the table itself.
//!
//! Demand is cumulative: `granted` counts every item the session has ever
//! requested, with [`UNBOUNDED`](crate::streams::UNBOUNDED) as the saturating top. The sender compares
//! its own cumulative sent count against the minimum grant across live
//! sessions, which yields both the unicast rule (one session, its demand)
//! and the multicast rule (move at the slowest subscriber's pace) without a
//! per-delivery decrement crossing task boundaries.

use std::{collections::HashMap, time::Duration};

use tokio::{sync::watch, time::Instant};

/// One remote subscriber's registration on this sender's stream.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id proposed in the Join frame; nonzero.
    pub session_id: u64,
    /// Last time any frame for this session arrived.
    pub last_heartbeat: Instant,
    /// Cumulative granted demand; [`UNBOUNDED`](crate::streams::UNBOUNDED) means no bound.
    pub granted: u64,
    /// Set by Cancel; the session yields no further frames and is removed
    /// at the end of the dispatch pass.
    pub cancelled: bool,
}

/// What the sender and aggregator see: live session count and the minimum
/// cumulative grant across live sessions (zero when none are live).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemandSnapshot {
    /// Number of joined, non-cancelled sessions.
    pub live: usize,
    /// Minimum cumulative grant across live sessions.
    pub min_granted: u64,
}

/// Session table for one sender.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<u64, Session>,
    heartbeat_timeout: Duration,
    snapshot: watch::Sender<DemandSnapshot>,
    ever_joined: bool,
}

impl SessionRegistry {
    /// Create a registry and the snapshot receiver its readers observe.
    #[must_use]
    pub fn new(heartbeat_timeout: Duration) -> (Self, watch::Receiver<DemandSnapshot>) {
        let (snapshot, rx) = watch::channel(DemandSnapshot::default());
        (Self { sessions: HashMap::new(), heartbeat_timeout, snapshot, ever_joined: false }, rx)
    }

    /// Register a Join. Demand starts at zero. A duplicate Join for a live
    /// session refreshes its liveness instead of resetting it. Returns
    /// `false` for the reserved broadcast id.
    pub fn on_join(&mut self, session_id: u64, now: Instant) -> bool {
        if session_id == 0 {
            return false;
        }

        self.sessions
            .entry(session_id)
            .and_modify(|s| s.last_heartbeat = now)
            .or_insert(Session { session_id, last_heartbeat: now, granted: 0, cancelled: false });
        self.ever_joined = true;
        self.publish();
        true
    }

    /// Grant more demand: saturating add with [`UNBOUNDED`](crate::streams::UNBOUNDED) as top.
    /// Returns `false` for unknown sessions.
    pub fn on_more(&mut self, session_id: u64, n: u64, now: Instant) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };

        session.granted = session.granted.saturating_add(n);
        session.last_heartbeat = now;
        self.publish();
        true
    }

    /// Mark a session cancelled. It stops counting toward demand at once
    /// and is removed by [`SessionRegistry::purge_cancelled`].
    pub fn on_cancel(&mut self, session_id: u64) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };

        session.cancelled = true;
        self.publish();
        true
    }

    /// Refresh liveness for any heartbeat or service frame.
    pub fn on_heartbeat(&mut self, session_id: u64, now: Instant) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };

        session.last_heartbeat = now;
        true
    }

    /// Remove sessions silent longer than the heartbeat timeout; returns
    /// their ids.
    pub fn reap(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.heartbeat_timeout;
        let dead: Vec<u64> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_heartbeat) > timeout)
            .map(|s| s.session_id)
            .collect();

        for id in &dead {
            self.sessions.remove(id);
        }
        if !dead.is_empty() {
            self.publish();
        }
        dead
    }

    /// Drop sessions marked cancelled; returns their ids.
    pub fn purge_cancelled(&mut self) -> Vec<u64> {
        let gone: Vec<u64> =
            self.sessions.values().filter(|s| s.cancelled).map(|s| s.session_id).collect();

        for id in &gone {
            self.sessions.remove(id);
        }
        if !gone.is_empty() {
            self.publish();
        }
        gone
    }

    /// Number of live (non-cancelled) sessions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.sessions.values().filter(|s| !s.cancelled).count()
    }

    /// Whether any session ever joined; distinguishes "everyone left" from
    /// "no one arrived yet" for auto-cancel.
    #[must_use]
    pub fn ever_joined(&self) -> bool {
        self.ever_joined
    }

    /// The current demand view.
    #[must_use]
    pub fn snapshot(&self) -> DemandSnapshot {
        let live: Vec<&Session> = self.sessions.values().filter(|s| !s.cancelled).collect();
        DemandSnapshot {
            live: live.len(),
            min_granted: live.iter().map(|s| s.granted).min().unwrap_or(0),
        }
    }

    fn publish(&self) {
        let _ = self.snapshot.send(self.snapshot());
    }
}
