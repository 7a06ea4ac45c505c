//! Consensus-dependent view of block producers.

use crate::actor::ActorService;
use crate::manager::PeerManagerHandle;
use crate::peer::{RemoteInfo, RemotePeer};
use crate::types::{Block, PeerId, PeerRole, PeerZone};
use crate::{NetworkError, NetworkResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval of reloading the elected producers.
pub const DPOS_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Deadline of one elected-producer lookup.
pub const GET_VOTES_TIMEOUT: Duration = Duration::from_secs(2);

/// Role change to apply to a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleModifier {
    pub id: PeerId,
    pub role: PeerRole,
}

pub trait RoleManager: Send + Sync {
    fn self_role(&self) -> PeerRole;

    /// Role of `id` according to the current producer set.
    fn get_role(&self, id: &PeerId) -> PeerRole;

    /// Whether the remote may act in the role it claims.
    fn check_role(&self, info: &RemoteInfo, claimed: PeerRole) -> bool;

    /// Peers that should receive a block produced notice.
    fn filter_bp_notice_receiver(
        &self,
        block: &Block,
        peers: Vec<Arc<RemotePeer>>,
        target_zone: PeerZone,
    ) -> Vec<Arc<RemotePeer>>;

    /// Peers that should receive a new block notice.
    fn filter_new_block_notice_receiver(
        &self,
        block: &Block,
        peers: Vec<Arc<RemotePeer>>,
    ) -> Vec<Arc<RemotePeer>>;

    /// Apply a producer set change and return the per-peer role updates.
    fn update_bp(&self, added: &[PeerId], removed: &[PeerId]) -> Vec<RoleModifier>;
}

fn modifiers(added: &[PeerId], removed: &[PeerId]) -> Vec<RoleModifier> {
    let mut changes = Vec::with_capacity(added.len() + removed.len());
    changes.extend(removed.iter().map(|id| RoleModifier {
        id: *id,
        role: PeerRole::Watcher,
    }));
    changes.extend(added.iter().map(|id| RoleModifier {
        id: *id,
        role: PeerRole::Producer,
    }));
    changes
}

/// Producer set driven by the Raft cluster membership.
pub struct RaftRoleManager {
    self_role: PeerRole,
    bps: Mutex<HashSet<PeerId>>,
}

impl RaftRoleManager {
    pub fn new(self_role: PeerRole) -> Self {
        Self {
            self_role,
            bps: Mutex::new(HashSet::new()),
        }
    }
}

impl RoleManager for RaftRoleManager {
    fn self_role(&self) -> PeerRole {
        self.self_role
    }

    fn get_role(&self, id: &PeerId) -> PeerRole {
        if self.bps.lock().contains(id) {
            PeerRole::Producer
        } else {
            PeerRole::Watcher
        }
    }

    fn check_role(&self, info: &RemoteInfo, claimed: PeerRole) -> bool {
        match claimed {
            PeerRole::Producer => self.get_role(&info.meta.id) == PeerRole::Producer,
            PeerRole::Agent => false,
            PeerRole::Watcher => true,
        }
    }

    fn filter_bp_notice_receiver(
        &self,
        _block: &Block,
        peers: Vec<Arc<RemotePeer>>,
        _target_zone: PeerZone,
    ) -> Vec<Arc<RemotePeer>> {
        // producers get blocks through raft
        peers
            .into_iter()
            .filter(|p| p.accepted_role() != PeerRole::Producer)
            .collect()
    }

    fn filter_new_block_notice_receiver(
        &self,
        block: &Block,
        peers: Vec<Arc<RemotePeer>>,
    ) -> Vec<Arc<RemotePeer>> {
        self.filter_bp_notice_receiver(block, peers, PeerZone::Internal)
    }

    fn update_bp(&self, added: &[PeerId], removed: &[PeerId]) -> Vec<RoleModifier> {
        let mut bps = self.bps.lock();
        for id in removed {
            bps.remove(id);
            debug!(peer = %id.short(), "Raft producer removed");
        }
        for id in added {
            bps.insert(*id);
            debug!(peer = %id.short(), "Raft producer added");
        }
        modifiers(added, removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteRank {
    Bp,
    Candidate,
}

/// Producer set rebuilt from the vote result.
///
/// The tracked union covers the elected producers plus as many runner-up
/// candidates, so a peer keeps its producer class across small rank
/// changes. An agent node additionally knows the producers it fronts.
pub struct DposRoleManager {
    self_role: PeerRole,
    union: RwLock<HashMap<PeerId, VoteRank>>,
    bps: RwLock<Vec<PeerId>>,
    managed: HashSet<PeerId>,
}

impl DposRoleManager {
    pub fn new(self_role: PeerRole, managed: Vec<PeerId>) -> Self {
        Self {
            self_role,
            union: RwLock::new(HashMap::new()),
            bps: RwLock::new(Vec::new()),
            managed: managed.into_iter().collect(),
        }
    }

    /// Currently elected producers, best first.
    pub fn bps(&self) -> Vec<PeerId> {
        self.bps.read().clone()
    }

    /// Replace the union with the vote result `elected` (best first) and
    /// return the role changes.
    pub fn apply_elected(&self, elected: &[PeerId], bp_count: usize) -> Vec<RoleModifier> {
        let cap = bp_count * 2;
        let mut union = HashMap::with_capacity(cap);
        let mut bps = Vec::with_capacity(bp_count);
        for (i, id) in elected.iter().take(cap).enumerate() {
            if i < bp_count {
                union.insert(*id, VoteRank::Bp);
                bps.push(*id);
            } else {
                union.insert(*id, VoteRank::Candidate);
            }
        }

        let (added, removed) = {
            let old = self.union.read();
            let added: Vec<PeerId> = union.keys().filter(|id| !old.contains_key(id)).copied().collect();
            let removed: Vec<PeerId> = old.keys().filter(|id| !union.contains_key(id)).copied().collect();
            (added, removed)
        };
        debug!(bps = bps.len(), union = union.len(), "Reloaded producer list");
        *self.union.write() = union;
        *self.bps.write() = bps;

        if added.is_empty() && removed.is_empty() {
            return Vec::new();
        }
        info!(
            added = added.len(),
            removed = removed.len(),
            "Producer list changed"
        );
        self.update_bp(&added, &removed)
    }

    /// Query the vote result and apply it.
    pub async fn refresh(&self, actor: &dyn ActorService) -> NetworkResult<Vec<RoleModifier>> {
        let bp_count = actor.bp_count();
        let elected = tokio::time::timeout(GET_VOTES_TIMEOUT, actor.get_elected(bp_count * 2))
            .await
            .map_err(|_| NetworkError::Timeout("elected producers".into()))??;
        Ok(self.apply_elected(&elected, bp_count))
    }

    /// Reload the producers now and then every [`DPOS_REFRESH_INTERVAL`],
    /// pushing role changes to connected peers.
    pub async fn run_refresh(
        self: Arc<Self>,
        actor: Arc<dyn ActorService>,
        peers: PeerManagerHandle,
        cancel: CancellationToken,
    ) {
        info!("Starting dpos role manager");
        let mut tick = tokio::time::interval_at(Instant::now(), DPOS_REFRESH_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => match self.refresh(actor.as_ref()).await {
                    Ok(changes) => peers.update_peer_roles(&changes),
                    Err(e) => warn!(error = %e, "Failed to get producer vote result"),
                },
            }
        }
        info!("Dpos role manager stopped");
    }
}

impl RoleManager for DposRoleManager {
    fn self_role(&self) -> PeerRole {
        self.self_role
    }

    fn get_role(&self, id: &PeerId) -> PeerRole {
        if self.union.read().contains_key(id) {
            PeerRole::Producer
        } else {
            PeerRole::Watcher
        }
    }

    fn check_role(&self, info: &RemoteInfo, claimed: PeerRole) -> bool {
        match claimed {
            PeerRole::Producer => self.get_role(&info.meta.id) == PeerRole::Producer,
            PeerRole::Agent => info
                .certificates
                .iter()
                .any(|c| self.get_role(&c.bp_id) == PeerRole::Producer),
            PeerRole::Watcher => true,
        }
    }

    fn filter_bp_notice_receiver(
        &self,
        _block: &Block,
        peers: Vec<Arc<RemotePeer>>,
        target_zone: PeerZone,
    ) -> Vec<Arc<RemotePeer>> {
        if self.self_role != PeerRole::Agent {
            return peers;
        }
        let producer_class = peers
            .into_iter()
            .filter(|p| matches!(p.accepted_role(), PeerRole::Producer | PeerRole::Agent));
        match target_zone {
            PeerZone::External => producer_class
                .filter(|p| p.zone() == PeerZone::External)
                .collect(),
            PeerZone::Internal => producer_class
                .filter(|p| self.managed.contains(&p.id()))
                .collect(),
        }
    }

    fn filter_new_block_notice_receiver(
        &self,
        _block: &Block,
        peers: Vec<Arc<RemotePeer>>,
    ) -> Vec<Arc<RemotePeer>> {
        peers
    }

    fn update_bp(&self, added: &[PeerId], removed: &[PeerId]) -> Vec<RoleModifier> {
        modifiers(added, removed)
    }
}
