//! Block and transaction synchronization driven by peer notices.

mod receiver;
mod tx;

pub use receiver::GetTxsReceiver;
pub use tx::{
    TxSyncManager, TxSyncTask, MAX_FRONT_PEERS, MAX_PEER_TX_QUERY, REFINE_INTERVAL,
    TX_CACHE_SIZE, TX_QUERY_TIMEOUT,
};

use crate::actor::{ActorService, ChainAccessor};
use crate::codec::MsgId;
use crate::manager::PeerManagerHandle;
use crate::message::GetBlockResponse;
use crate::order::MsgOrderFactory;
use crate::peer::RemotePeer;
use crate::service::P2PCommand;
use crate::types::{Block, BlockId, PeerId, Tx, TxId};
use crate::{NetworkResult, MAX_BLOCK_SIZE};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Block hashes already seen through notices.
pub const BLK_CACHE_SIZE: usize = 300;

/// Routes incoming notices to the chain and mempool.
///
/// Every block hash is acted upon once: the notice cache stops repeated
/// fetches and the dispatch cache stops repeated `add_block` posts when
/// the same block arrives both in a notice and in a fetch response.
pub struct SyncManager {
    chain: Arc<dyn ChainAccessor>,
    actor: Arc<dyn ActorService>,
    commands: mpsc::Sender<P2PCommand>,
    blk_cache: Mutex<LruCache<BlockId, ()>>,
    dispatched: Mutex<LruCache<BlockId, ()>>,
    tx: TxSyncManager,
}

fn contains_or_add(cache: &Mutex<LruCache<BlockId, ()>>, hash: BlockId) -> bool {
    let mut cache = cache.lock();
    if cache.contains(&hash) {
        return true;
    }
    cache.put(hash, ());
    false
}

impl SyncManager {
    pub fn new(
        chain: Arc<dyn ChainAccessor>,
        actor: Arc<dyn ActorService>,
        peers: PeerManagerHandle,
        factory: MsgOrderFactory,
        commands: mpsc::Sender<P2PCommand>,
    ) -> (Self, TxSyncTask) {
        let (tx, task) = TxSyncManager::new(actor.clone(), peers, factory);
        let size = NonZeroUsize::new(BLK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        let manager = Self {
            chain,
            actor,
            commands,
            blk_cache: Mutex::new(LruCache::new(size)),
            dispatched: Mutex::new(LruCache::new(size)),
            tx,
        };
        (manager, task)
    }

    pub fn tx(&self) -> &TxSyncManager {
        &self.tx
    }

    fn dispatch(&self, peer: PeerId, block: Block) {
        if contains_or_add(&self.dispatched, block.hash) {
            debug!(peer = %peer.short(), block = %block.hash, "Block already dispatched");
            return;
        }
        debug!(peer = %peer.short(), block = %block.hash, no = block.block_no(), "Adding block from peer");
        self.actor.add_block(peer, block);
    }

    /// A producer pushed a whole block. Returns `true` if it was new.
    pub fn handle_block_produced_notice(&self, peer: PeerId, block: Block) -> bool {
        let size = block.size();
        if size > MAX_BLOCK_SIZE {
            warn!(peer = %peer.short(), block = %block.hash, size, "Produced block is too big, dropped");
            return false;
        }
        if contains_or_add(&self.blk_cache, block.hash) {
            return false;
        }
        self.dispatch(peer, block);
        true
    }

    /// A peer announced a block hash. Fetches it if unknown.
    pub fn handle_new_block_notice(&self, peer: PeerId, hash: BlockId, block_no: u64) {
        if contains_or_add(&self.blk_cache, hash) {
            return;
        }
        match self.chain.get_block(&hash) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            // fetch anyway, the chain sorts out duplicates
            Err(e) => warn!(block = %hash, error = %e, "Failed to look up noticed block"),
        }
        debug!(peer = %peer.short(), block = %hash, no = block_no, "Fetching noticed block");
        let cmd = P2PCommand::GetBlockInfos {
            to: peer,
            hashes: vec![hash],
        };
        if let Err(e) = self.commands.try_send(cmd) {
            warn!(peer = %peer.short(), error = %e, "Failed to request noticed block");
            // let a later notice retry the fetch
            self.blk_cache.lock().pop(&hash);
        }
    }

    /// Answer to a block fetch. Only single-block answers feed the chain.
    pub fn handle_get_block_response(&self, peer: PeerId, msg_id: MsgId, resp: GetBlockResponse) {
        let mut blocks = resp.blocks;
        if blocks.len() != 1 {
            debug!(
                peer = %peer.short(),
                orig_id = %msg_id,
                count = blocks.len(),
                "Block response is not a single block, ignored"
            );
            return;
        }
        let Some(block) = blocks.pop() else { return };
        if block.size() > MAX_BLOCK_SIZE {
            warn!(peer = %peer.short(), block = %block.hash, "Fetched block is too big, dropped");
            return;
        }
        self.dispatch(peer, block);
    }

    pub fn handle_new_tx_notice(&self, peer: PeerId, hashes: Vec<TxId>) {
        self.tx.handle_new_tx_notice(peer, hashes);
    }

    pub fn handle_get_tx_req(
        &self,
        peer: Arc<RemotePeer>,
        msg_id: MsgId,
        hashes: Vec<TxId>,
    ) -> NetworkResult<()> {
        self.tx.handle_get_tx_req(peer, msg_id, hashes)
    }

    pub fn register_txs(&self, txs: &[Tx]) {
        self.tx.register_txs(txs);
    }
}
