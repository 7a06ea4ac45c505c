//! Transaction pull synchronization.
//!
//! Notices only carry hashes. Hashes we do not know yet enter the front
//! cache together with the peers that announced them, and a periodic
//! refine pass turns the front cache into per-peer `GetTxsRequest`s.
//! Each hash is asked from one peer at a time; when that peer fails to
//! deliver, the next announcer is tried.

use super::receiver::GetTxsReceiver;
use crate::actor::{ActorService, DEFAULT_ACTOR_MSG_TTL};
use crate::codec::MsgId;
use crate::manager::PeerManagerHandle;
use crate::message::{GetTransactionsRequest, GetTransactionsResponse, SubProtocol};
use crate::order::MsgOrderFactory;
use crate::peer::RemotePeer;
use crate::types::{PeerId, ResultStatus, Tx, TxId};
use crate::wire::{field_size, Payload};
use crate::{
    NetworkError, NetworkResult, EMPTY_GET_BLOCK_RESPONSE_SIZE, MAX_PAYLOAD_LENGTH,
    MAX_REQUEST_HASHES,
};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Txs known to be in the local mempool.
pub const TX_CACHE_SIZE: usize = 50_000;

/// A pulled hash not answered within this time is asked elsewhere.
pub const TX_QUERY_TIMEOUT: Duration = Duration::from_secs(4);

pub const REFINE_INTERVAL: Duration = Duration::from_millis(250);

/// Maximum hashes pulled from one peer per refine pass.
pub const MAX_PEER_TX_QUERY: usize = 2000;

/// Announcers remembered per front cache entry.
pub const MAX_FRONT_PEERS: usize = 4;

const TASK_QUEUE_SIZE: usize = 20;
const QUERY_QUEUE_SIZE: usize = 10;

/// Inputs of the front cache loop.
#[derive(Debug)]
pub(crate) enum TxEvent {
    Notice { peer: PeerId, hashes: Vec<TxId> },
    /// The txs were accepted by the mempool.
    Registered { hashes: Vec<TxId> },
    /// The peer was busy; ask again later.
    Retry { peer: PeerId, hashes: Vec<TxId> },
    /// The pull failed; try the next announcer.
    Burn { hashes: Vec<TxId> },
}

struct TxQuery {
    peer: Arc<RemotePeer>,
    msg_id: MsgId,
    hashes: Vec<TxId>,
}

#[derive(Debug)]
struct FrontEntry {
    last_sent: Option<Instant>,
    peers: VecDeque<PeerId>,
}

impl FrontEntry {
    fn push_peer(&mut self, peer: PeerId) {
        if self.peers.contains(&peer) {
            return;
        }
        if self.peers.len() >= MAX_FRONT_PEERS {
            self.peers.pop_front();
        }
        self.peers.push_back(peer);
    }
}

/// Cloneable entry points of the tx sync engine.
#[derive(Clone)]
pub struct TxSyncManager {
    notices: mpsc::Sender<TxEvent>,
    events: mpsc::UnboundedSender<TxEvent>,
    queries: mpsc::Sender<TxQuery>,
    tx_cache: Arc<Mutex<LruCache<TxId, Tx>>>,
}

impl TxSyncManager {
    pub fn new(
        actor: Arc<dyn ActorService>,
        peers: PeerManagerHandle,
        factory: MsgOrderFactory,
    ) -> (Self, TxSyncTask) {
        let (notices, notice_rx) = mpsc::channel(TASK_QUEUE_SIZE);
        let (events, event_rx) = mpsc::unbounded_channel();
        let (queries, query_rx) = mpsc::channel(QUERY_QUEUE_SIZE);
        let tx_cache = Arc::new(Mutex::new(LruCache::new(
            NonZeroUsize::new(TX_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
        )));
        let task = TxSyncTask {
            front: FrontCache {
                entries: HashMap::new(),
                tx_cache: tx_cache.clone(),
            },
            notices: notice_rx,
            events: event_rx,
            event_tx: events.clone(),
            queries: Some(query_rx),
            actor,
            peers,
            factory,
        };
        let manager = Self {
            notices,
            events,
            queries,
            tx_cache,
        };
        (manager, task)
    }

    /// Queue announced hashes. Dropped when the loop is backlogged.
    pub fn handle_new_tx_notice(&self, peer: PeerId, hashes: Vec<TxId>) {
        match self.notices.try_send(TxEvent::Notice { peer, hashes }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(peer = %peer.short(), "Tx sync manager is busy, notice dropped");
            }
            Err(TrySendError::Closed(_)) => debug!("Tx sync manager is stopped"),
        }
    }

    /// Record txs accepted by the local mempool.
    pub fn register_txs(&self, txs: &[Tx]) {
        {
            let mut cache = self.tx_cache.lock();
            for tx in txs {
                cache.put(tx.hash, tx.clone());
            }
        }
        let hashes = txs.iter().map(|t| t.hash).collect();
        if self.events.send(TxEvent::Registered { hashes }).is_err() {
            debug!("Tx sync manager is stopped");
        }
    }

    /// Queue a pull from a remote. Fails with `ResourceExhausted` when
    /// too many pulls are being served.
    pub fn handle_get_tx_req(
        &self,
        peer: Arc<RemotePeer>,
        msg_id: MsgId,
        hashes: Vec<TxId>,
    ) -> NetworkResult<()> {
        self.queries
            .try_send(TxQuery {
                peer,
                msg_id,
                hashes,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => NetworkError::ResourceExhausted,
                TrySendError::Closed(_) => NetworkError::ActorUnavailable("tx sync".into()),
            })
    }

    pub fn is_known(&self, hash: &TxId) -> bool {
        self.tx_cache.lock().contains(hash)
    }
}

/// Front cache with its per-hash pull state.
struct FrontCache {
    entries: HashMap<TxId, FrontEntry>,
    tx_cache: Arc<Mutex<LruCache<TxId, Tx>>>,
}

impl FrontCache {
    fn add_notice(&mut self, peer: PeerId, hashes: Vec<TxId>) -> usize {
        let known = self.tx_cache.lock();
        let mut added = 0;
        for hash in hashes {
            if known.contains(&hash) {
                continue;
            }
            self.entries
                .entry(hash)
                .and_modify(|e| e.push_peer(peer))
                .or_insert_with(|| {
                    added += 1;
                    FrontEntry {
                        last_sent: None,
                        peers: VecDeque::from([peer]),
                    }
                });
        }
        added
    }

    fn remove(&mut self, hashes: &[TxId]) {
        for hash in hashes {
            self.entries.remove(hash);
        }
    }

    /// Put the busy peer back as the last candidate and mark unsent.
    fn retry(&mut self, peer: PeerId, hashes: &[TxId]) {
        for hash in hashes {
            if let Some(entry) = self.entries.get_mut(hash) {
                entry.push_peer(peer);
                entry.last_sent = None;
            }
        }
    }

    fn burn(&mut self, hashes: &[TxId]) {
        for hash in hashes {
            let drop = match self.entries.get_mut(hash) {
                Some(entry) if entry.peers.is_empty() => true,
                Some(entry) => {
                    entry.last_sent = None;
                    false
                }
                None => false,
            };
            if drop {
                self.entries.remove(hash);
            }
        }
    }

    /// Assign every due hash to one of its announcers.
    fn refine(&mut self, now: Instant) -> HashMap<PeerId, Vec<TxId>> {
        let mut send_map: HashMap<PeerId, Vec<TxId>> = HashMap::new();
        self.entries.retain(|hash, entry| {
            if let Some(sent) = entry.last_sent {
                if now.saturating_duration_since(sent) < TX_QUERY_TIMEOUT {
                    return true;
                }
            }
            if entry.peers.is_empty() {
                return false;
            }
            let slot = entry.peers.iter().position(|p| {
                send_map
                    .get(p)
                    .map_or(true, |list| list.len() < MAX_PEER_TX_QUERY)
            });
            if let Some(idx) = slot {
                if let Some(peer) = entry.peers.remove(idx) {
                    send_map.entry(peer).or_default().push(*hash);
                    entry.last_sent = Some(now);
                }
            }
            true
        });
        send_map
    }
}

/// Event loop owning the front cache, plus the pull server.
pub struct TxSyncTask {
    front: FrontCache,
    notices: mpsc::Receiver<TxEvent>,
    events: mpsc::UnboundedReceiver<TxEvent>,
    event_tx: mpsc::UnboundedSender<TxEvent>,
    queries: Option<mpsc::Receiver<TxQuery>>,
    actor: Arc<dyn ActorService>,
    peers: PeerManagerHandle,
    factory: MsgOrderFactory,
}

impl TxSyncTask {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Tx sync manager started");
        if let Some(queries) = self.queries.take() {
            let server = TxQueryServer {
                tx_cache: self.front.tx_cache.clone(),
                actor: self.actor.clone(),
                factory: self.factory,
            };
            tokio::spawn(server.run(queries, cancel.clone()));
        }

        let mut refine = tokio::time::interval(REFINE_INTERVAL);
        refine.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = self.notices.recv() => self.handle_event(event),
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = refine.tick() => self.refine_and_send(Instant::now()),
            }
        }
        info!("Tx sync manager stopped");
    }

    fn handle_event(&mut self, event: TxEvent) {
        match event {
            TxEvent::Notice { peer, hashes } => {
                let added = self.front.add_notice(peer, hashes);
                if added > 0 {
                    debug!(peer = %peer.short(), added, "New txs in front cache");
                }
            }
            TxEvent::Registered { hashes } => self.front.remove(&hashes),
            TxEvent::Retry { peer, hashes } => self.front.retry(peer, &hashes),
            TxEvent::Burn { hashes } => self.front.burn(&hashes),
        }
    }

    fn refine_and_send(&mut self, now: Instant) {
        if self.front.entries.is_empty() {
            return;
        }
        for (peer_id, hashes) in self.front.refine(now) {
            let peer = match self.peers.get_peer(&peer_id) {
                Some(peer) if peer.is_running() => peer,
                _ => {
                    debug!(peer = %peer_id.short(), count = hashes.len(), "Peer is gone, tx pull moved on");
                    self.front.burn(&hashes);
                    continue;
                }
            };
            let receiver = GetTxsReceiver::new(
                peer_id,
                hashes.clone(),
                self.actor.clone(),
                self.event_tx.clone(),
            );
            let body = GetTransactionsRequest { hashes };
            match self.factory.new_request_with_receiver(
                SubProtocol::GET_TXS_REQUEST,
                &body,
                Box::new(receiver),
            ) {
                Some(order) => {
                    debug!(peer = %peer_id.short(), count = body.hashes.len(), "Pulling txs");
                    peer.send_message(order);
                }
                None => self.front.burn(&body.hashes),
            }
        }
    }
}

/// Serves `GetTxsRequest`s from the tx cache and the mempool.
struct TxQueryServer {
    tx_cache: Arc<Mutex<LruCache<TxId, Tx>>>,
    actor: Arc<dyn ActorService>,
    factory: MsgOrderFactory,
}

impl TxQueryServer {
    async fn run(self, mut queries: mpsc::Receiver<TxQuery>, cancel: CancellationToken) {
        loop {
            let query = tokio::select! {
                _ = cancel.cancelled() => break,
                query = queries.recv() => query,
            };
            let Some(query) = query else { break };
            let peer = query.peer.id();
            if let Err(e) = self.serve(query).await {
                debug!(peer = %peer.short(), error = %e, "Failed to answer tx pull");
            }
        }
    }

    async fn lookup(&self, hashes: &[TxId]) -> Vec<Option<Tx>> {
        let mut found: Vec<Option<Tx>> = {
            let mut cache = self.tx_cache.lock();
            hashes.iter().map(|h| cache.get(h).cloned()).collect()
        };
        let missing: Vec<usize> = (0..hashes.len()).filter(|i| found[*i].is_none()).collect();
        for chunk in missing.chunks(MAX_REQUEST_HASHES) {
            let ask: Vec<TxId> = chunk.iter().map(|i| hashes[*i]).collect();
            let result =
                tokio::time::timeout(DEFAULT_ACTOR_MSG_TTL, self.actor.mempool_exist_ex(&ask)).await;
            match result {
                Ok(Ok(txs)) => {
                    for (idx, tx) in chunk.iter().zip(txs) {
                        found[*idx] = tx;
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "Mempool lookup failed"),
                Err(_) => warn!("Mempool lookup timed out"),
            }
        }
        found
    }

    async fn serve(&self, query: TxQuery) -> NetworkResult<()> {
        let TxQuery {
            peer,
            msg_id,
            hashes,
        } = query;
        let found = self.lookup(&hashes).await;

        let mut any = false;
        let mut size = EMPTY_GET_BLOCK_RESPONSE_SIZE;
        let mut chunk_hashes = Vec::new();
        let mut chunk_txs = Vec::new();
        for (hash, tx) in hashes.into_iter().zip(found) {
            let Some(tx) = tx else { continue };
            any = true;
            let item = field_size(hash.encoded_len()) + field_size(tx.encoded_len());
            if size + item > MAX_PAYLOAD_LENGTH && !chunk_txs.is_empty() {
                let body = GetTransactionsResponse {
                    status: ResultStatus::Ok,
                    hashes: std::mem::take(&mut chunk_hashes),
                    txs: std::mem::take(&mut chunk_txs),
                    has_next: true,
                };
                self.respond(&peer, msg_id, &body).await?;
                size = EMPTY_GET_BLOCK_RESPONSE_SIZE;
            }
            size += item;
            chunk_hashes.push(hash);
            chunk_txs.push(tx);
        }
        let body = GetTransactionsResponse {
            status: if any {
                ResultStatus::Ok
            } else {
                ResultStatus::NotFound
            },
            hashes: chunk_hashes,
            txs: chunk_txs,
            has_next: false,
        };
        self.respond(&peer, msg_id, &body).await
    }

    async fn respond(
        &self,
        peer: &RemotePeer,
        msg_id: MsgId,
        body: &GetTransactionsResponse,
    ) -> NetworkResult<()> {
        let order = self
            .factory
            .new_response(msg_id, SubProtocol::GET_TXS_RESPONSE, body)
            .ok_or_else(|| NetworkError::Serialization("tx response".into()))?;
        peer.send_and_wait(order).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::framed;
    use crate::handlers::HandlerRegistry;
    use crate::peer::LastStatus;
    use crate::testutil::{remote_info, test_env, TestActor};
    use crate::types::Hash32;
    use futures::StreamExt;

    fn ids(n: usize, tag: &str) -> Vec<TxId> {
        (0..n)
            .map(|i| Hash32::digest(format!("{}{}", tag, i).as_bytes()))
            .collect()
    }

    fn peer_id(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn front() -> FrontCache {
        FrontCache {
            entries: HashMap::new(),
            tx_cache: Arc::new(Mutex::new(LruCache::new(NonZeroUsize::new(16).unwrap()))),
        }
    }

    #[test]
    fn test_notice_dedup_and_peer_ring() {
        let mut fc = front();
        let hash = ids(1, "a")[0];
        assert_eq!(fc.add_notice(peer_id(1), vec![hash]), 1);
        for seed in 2..=6 {
            assert_eq!(fc.add_notice(peer_id(seed), vec![hash]), 0);
        }
        let peers: Vec<PeerId> = fc.entries[&hash].peers.iter().copied().collect();
        assert_eq!(peers, (3..=6).map(peer_id).collect::<Vec<_>>());

        let known = Tx::new(b"known".to_vec());
        fc.tx_cache.lock().put(known.hash, known.clone());
        assert_eq!(fc.add_notice(peer_id(1), vec![known.hash]), 0);
        assert!(!fc.entries.contains_key(&known.hash));
    }

    #[test]
    fn test_refine_splits_per_peer_and_waits() {
        let mut fc = front();
        let from_p1 = ids(MAX_PEER_TX_QUERY, "p1");
        let from_p2 = ids(MAX_PEER_TX_QUERY, "p2");
        fc.add_notice(peer_id(1), from_p1.clone());
        fc.add_notice(peer_id(2), from_p2.clone());

        let now = Instant::now();
        let sends = fc.refine(now);
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[&peer_id(1)].len(), MAX_PEER_TX_QUERY);
        assert_eq!(sends[&peer_id(2)].len(), MAX_PEER_TX_QUERY);

        // within the query timeout nothing is re-sent
        assert!(fc.refine(now + Duration::from_secs(1)).is_empty());
        assert_eq!(fc.entries.len(), 2 * MAX_PEER_TX_QUERY);

        // past the timeout with no other announcer, entries expire
        assert!(fc.refine(now + TX_QUERY_TIMEOUT).is_empty());
        assert!(fc.entries.is_empty());
    }

    #[test]
    fn test_full_slot_moves_to_next_peer() {
        let mut fc = front();
        let hashes = ids(MAX_PEER_TX_QUERY + 1, "x");
        fc.add_notice(peer_id(1), hashes.clone());
        fc.add_notice(peer_id(2), hashes.clone());
        let sends = fc.refine(Instant::now());
        assert_eq!(sends[&peer_id(1)].len(), MAX_PEER_TX_QUERY);
        assert_eq!(sends[&peer_id(2)].len(), 1);
    }

    #[test]
    fn test_retry_and_burn() {
        let mut fc = front();
        let hashes = ids(3, "r");
        fc.add_notice(peer_id(1), hashes.clone());
        fc.add_notice(peer_id(2), vec![hashes[0]]);
        let now = Instant::now();
        let sends = fc.refine(now);
        assert_eq!(sends[&peer_id(1)].len(), 3);

        // busy peer goes back as the last candidate
        fc.retry(peer_id(1), &hashes);
        let sends = fc.refine(now);
        assert_eq!(sends[&peer_id(2)], vec![hashes[0]]);
        assert_eq!(sends[&peer_id(1)].len(), 2);

        // hashes[0] still has peer 1 queued, the rest have no peers left
        fc.burn(&hashes);
        assert_eq!(fc.entries.len(), 1);
        assert!(fc.entries[&hashes[0]].last_sent.is_none());

        fc.remove(&hashes);
        assert!(fc.entries.is_empty());
    }

    #[tokio::test]
    async fn test_serve_chunks_and_status() {
        let actor = Arc::new(TestActor::default());
        let in_pool = Tx::new(b"pool".to_vec());
        actor.mempool.lock().insert(in_pool.hash, in_pool.clone());
        let cached = Tx::new(b"cached".to_vec());
        let server = TxQueryServer {
            tx_cache: Arc::new(Mutex::new(LruCache::new(NonZeroUsize::new(16).unwrap()))),
            actor,
            factory: MsgOrderFactory::new(),
        };
        server.tx_cache.lock().put(cached.hash, cached.clone());

        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peer = RemotePeer::new(
            remote_info(),
            LastStatus {
                block_hash: Hash32::default(),
                block_no: 0,
            },
            test_env().env,
        );
        peer.start(framed(Box::new(local)), HandlerRegistry::new());
        let mut remote = framed(Box::new(remote));

        let msg_id = MsgId::new();
        let unknown = Hash32::digest(b"unknown");
        server
            .serve(TxQuery {
                peer: peer.clone(),
                msg_id,
                hashes: vec![cached.hash, unknown, in_pool.hash],
            })
            .await
            .unwrap();
        let msg = remote.next().await.unwrap().unwrap();
        assert_eq!(msg.original_id, msg_id);
        let body = GetTransactionsResponse::decode(&msg.payload).unwrap();
        assert_eq!(body.status, ResultStatus::Ok);
        assert_eq!(body.hashes, vec![cached.hash, in_pool.hash]);
        assert!(!body.has_next);

        server
            .serve(TxQuery {
                peer: peer.clone(),
                msg_id,
                hashes: vec![unknown],
            })
            .await
            .unwrap();
        let msg = remote.next().await.unwrap().unwrap();
        let body = GetTransactionsResponse::decode(&msg.payload).unwrap();
        assert_eq!(body.status, ResultStatus::NotFound);
        assert!(body.txs.is_empty());
        peer.stop();
    }
}
