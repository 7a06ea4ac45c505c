//! Known but unconnected peers and the outbound dial schedule.
//!
//! The table is owned by the peer manager loop and never shared, so it
//! needs no locking. Only designated peers survive a failed dial; they
//! are retried on an exponential schedule.

use crate::types::{PeerId, PeerMeta};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Outbound dials allowed in flight at once.
pub const MAX_CONCURRENT_HANDSHAKE: usize = 4;

/// Delay before the first reconnect of a designated peer that left.
pub const FIRST_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Number of distinct backoff slots. Later trials reuse the last one.
pub const BACKOFF_SLOTS: u32 = 15;

/// Retry delay after `trial` failed dials: `round(exp(0.6 n) * 20)` seconds.
pub fn backoff_delay(trial: u32) -> Duration {
    let n = trial.min(BACKOFF_SLOTS - 1);
    let secs = ((n as f64) * 0.6).exp() * 20.0;
    Duration::from_secs(secs.round() as u64)
}

/// A peer waiting for its next dial.
#[derive(Debug, Clone)]
pub struct WaitingPeer {
    pub meta: PeerMeta,
    pub trial_cnt: u32,
    pub next_trial: Instant,
    pub last_result: Option<String>,
}

impl WaitingPeer {
    fn new(meta: PeerMeta, next_trial: Instant) -> Self {
        Self {
            meta,
            trial_cnt: 0,
            next_trial,
            last_result: None,
        }
    }
}

pub struct WaitingPeerManager {
    self_id: PeerId,
    /// Discovery is on: accept discovered peers and respect `max_peers`.
    dynamic: bool,
    max_peers: usize,
    peers: HashMap<PeerId, WaitingPeer>,
    in_flight: HashSet<PeerId>,
}

impl WaitingPeerManager {
    pub fn new(self_id: PeerId, dynamic: bool, max_peers: usize) -> Self {
        Self {
            self_id,
            dynamic,
            max_peers,
            peers: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&WaitingPeer> {
        self.peers.get(id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_dialing(&self, id: &PeerId) -> bool {
        self.in_flight.contains(id)
    }

    /// Queue a peer unless it is already known.
    pub fn add_peer(&mut self, meta: PeerMeta, now: Instant) {
        if meta.id == self.self_id {
            return;
        }
        self.peers
            .entry(meta.id)
            .or_insert_with(|| WaitingPeer::new(meta, now));
    }

    pub fn on_peer_connect(&mut self, id: &PeerId) {
        if self.peers.remove(id).is_some() {
            debug!(peer = %id.short(), "Connected peer left the waiting pool");
        }
    }

    /// A session ended. Designated peers come back after a cool time.
    pub fn on_peer_disconnect(&mut self, meta: &PeerMeta, now: Instant) {
        if !meta.designated {
            return;
        }
        debug!(peer = %meta.id.short(), "Designated peer will be reconnected after cool time");
        self.peers.insert(
            meta.id,
            WaitingPeer::new(meta.clone(), now + FIRST_RECONNECT_DELAY),
        );
    }

    /// Add peers learned from other nodes. Returns the number added.
    pub fn on_discovered(
        &mut self,
        metas: Vec<PeerMeta>,
        is_connected: impl Fn(&PeerId) -> bool,
        now: Instant,
    ) -> usize {
        if !self.dynamic {
            return 0;
        }
        let mut added = 0;
        for meta in metas {
            if meta.id == self.self_id
                || is_connected(&meta.id)
                || self.peers.contains_key(&meta.id)
                || self.in_flight.contains(&meta.id)
            {
                continue;
            }
            if !meta.addresses.iter().any(|a| a.is_dialable()) {
                continue;
            }
            self.peers.insert(meta.id, WaitingPeer::new(meta, now));
            added += 1;
        }
        added
    }

    fn remaining_spaces(&self, connected: usize) -> usize {
        if self.peers.is_empty() {
            return 0;
        }
        let workers = MAX_CONCURRENT_HANDSHAKE.saturating_sub(self.in_flight.len());
        if !self.dynamic {
            return workers;
        }
        let room = self
            .max_peers
            .saturating_sub(connected + self.in_flight.len());
        workers.min(room)
    }

    /// Pick the peers to dial now, earliest trial first, and mark them in flight.
    pub fn next_dials(&mut self, now: Instant, connected: usize) -> Vec<PeerMeta> {
        let max_jobs = self.remaining_spaces(connected);
        if max_jobs == 0 {
            return Vec::new();
        }
        let mut due: Vec<&WaitingPeer> = self
            .peers
            .values()
            .filter(|wp| wp.next_trial <= now && !self.in_flight.contains(&wp.meta.id))
            .collect();
        due.sort_by_key(|wp| wp.next_trial);
        let picked: Vec<PeerMeta> = due
            .into_iter()
            .take(max_jobs)
            .map(|wp| wp.meta.clone())
            .collect();
        for meta in &picked {
            let trial = self.peers.get(&meta.id).map_or(0, |wp| wp.trial_cnt);
            info!(peer = %meta.id.short(), trial, "Starting scheduled try to connect peer");
            self.in_flight.insert(meta.id);
        }
        picked
    }

    /// A dial finished. Failed designated peers are rescheduled, others dropped.
    pub fn on_work_done(&mut self, id: &PeerId, result: Result<(), String>, now: Instant) {
        self.in_flight.remove(id);
        let Some(wp) = self.peers.get_mut(id) else {
            debug!(peer = %id.short(), "Connection job finished");
            return;
        };
        match result {
            Ok(()) => {
                self.peers.remove(id);
            }
            Err(e) if wp.meta.designated => {
                wp.trial_cnt += 1;
                let delay = backoff_delay(wp.trial_cnt);
                wp.next_trial = now + delay;
                debug!(
                    peer = %id.short(),
                    trial = wp.trial_cnt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Failed connection will be retried"
                );
                wp.last_result = Some(e);
            }
            Err(e) => {
                debug!(peer = %id.short(), error = %e, "Dropping failed peer");
                self.peers.remove(id);
            }
        }
    }
}
