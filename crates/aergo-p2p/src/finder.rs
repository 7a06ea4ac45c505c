//! Peer discovery: decides whom to ask for more peer addresses.

use crate::types::{PeerId, PeerMeta};
use crate::waiting::WaitingPeerManager;
use crate::NetworkResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DISCOVER_INTERVAL: Duration = Duration::from_secs(30);
pub const PEER_FIRST_INTERVAL: Duration = Duration::from_secs(30);
pub const PEER_QUERY_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const POLARIS_QUERY_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Address queries issued per discovery tick.
pub const MAX_CONCURRENT_QUERY: usize = 4;

pub const MAX_ADDR_LIST_SIZE_PEER: u32 = 50;
pub const MAX_ADDR_LIST_SIZE_POLARIS: usize = 200;

/// External directory of network peers.
#[async_trait]
pub trait PolarisClient: Send + Sync {
    async fn query_peers(&self, count: usize) -> NetworkResult<Vec<PeerMeta>>;
}

/// Queries one discovery tick wants issued.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct FinderQueries {
    pub peers: Vec<PeerId>,
    pub polaris: bool,
}

/// Owned by the peer manager loop.
pub(crate) struct PeerFinder {
    designated: Vec<PeerMeta>,
    discover: bool,
    max_cap: usize,
    /// Next address query turn of each connected peer.
    next_turns: HashMap<PeerId, Instant>,
    polaris: Option<Arc<dyn PolarisClient>>,
    polaris_turn: Option<Instant>,
}

impl PeerFinder {
    pub fn new(
        designated: Vec<PeerMeta>,
        discover: bool,
        max_cap: usize,
        polaris: Option<Arc<dyn PolarisClient>>,
    ) -> Self {
        Self {
            designated,
            discover,
            max_cap,
            next_turns: HashMap::new(),
            polaris,
            polaris_turn: None,
        }
    }

    pub fn polaris(&self) -> Option<Arc<dyn PolarisClient>> {
        self.polaris.clone()
    }

    pub fn on_peer_connect(&mut self, id: PeerId, now: Instant) {
        if self.discover {
            self.next_turns
                .entry(id)
                .or_insert(now + PEER_FIRST_INTERVAL);
        }
    }

    pub fn on_peer_disconnect(&mut self, id: &PeerId) {
        self.next_turns.remove(id);
    }

    /// Refill the waiting pool with missing designated peers and pick the
    /// address queries due at `now`.
    pub fn check_and_fill(
        &mut self,
        waiting: &mut WaitingPeerManager,
        is_connected: impl Fn(&PeerId) -> bool,
        now: Instant,
    ) -> FinderQueries {
        for meta in &self.designated {
            if !is_connected(&meta.id) && !waiting.contains(&meta.id) && !waiting.is_dialing(&meta.id) {
                waiting.add_peer(meta.clone(), now);
            }
        }

        let mut queries = FinderQueries::default();
        if !self.discover || waiting.len() >= self.max_cap {
            return queries;
        }
        if self.polaris.is_some() && self.polaris_turn.map_or(true, |t| now >= t) {
            self.polaris_turn = Some(now + POLARIS_QUERY_INTERVAL);
            queries.polaris = true;
        }
        for (id, turn) in self.next_turns.iter_mut() {
            if queries.peers.len() >= MAX_CONCURRENT_QUERY {
                break;
            }
            if *turn <= now {
                *turn = now + PEER_QUERY_INTERVAL;
                queries.peers.push(*id);
            }
        }
        if !queries.peers.is_empty() {
            debug!(count = queries.peers.len(), "Querying peers for addresses");
        }
        queries
    }
}
