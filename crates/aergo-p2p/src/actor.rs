//! Interfaces to the node services outside the P2P layer.
//!
//! The chain service, the mempool and the consensus cluster are
//! collaborators: the P2P layer queries them and posts messages to them
//! but never owns their state.

use crate::message::RaftWrapperMessage;
use crate::types::{Block, BlockId, PeerId, Tx, TxId};
use crate::NetworkResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Default timeout of a request to another service.
pub const DEFAULT_ACTOR_MSG_TTL: Duration = Duration::from_secs(4);

/// Synchronous read access to the local chain.
pub trait ChainAccessor: Send + Sync {
    /// Current best block.
    fn best_block(&self) -> NetworkResult<Block>;

    /// Chain identifier in effect at `block_no`.
    fn chain_id(&self, block_no: u64) -> Bytes;

    fn genesis_hash(&self) -> BlockId;

    fn get_block(&self, hash: &BlockId) -> NetworkResult<Option<Block>>;

    /// Main-chain block hash at `block_no`.
    fn get_hash_by_no(&self, block_no: u64) -> NetworkResult<Option<BlockId>>;
}

/// Messaging with the chain service, mempool and consensus.
///
/// Methods without a return value are fire-and-forget posts.
#[async_trait]
pub trait ActorService: Send + Sync {
    /// Look up `hashes` in the mempool; one slot per hash, `None` when absent.
    async fn mempool_exist_ex(&self, hashes: &[TxId]) -> NetworkResult<Vec<Option<Tx>>>;

    /// Top `count` accounts of the producer vote, best first.
    async fn get_elected(&self, count: usize) -> NetworkResult<Vec<PeerId>>;

    /// Number of block producers in the current consensus configuration.
    fn bp_count(&self) -> usize;

    /// Hand a block received from `peer` to the chain service.
    fn add_block(&self, peer: PeerId, block: Block);

    /// Hand a transaction received from a peer to the mempool.
    fn mempool_put(&self, tx: Tx);

    /// Tell the chain service about a newly connected peer's best block.
    fn sync_block_state(&self, peer: PeerId, block_no: u64, block_hash: BlockId);
}

/// Raft transport hooks.
pub trait RaftAccessor: Send + Sync {
    fn receive(&self, from: PeerId, msg: RaftWrapperMessage);

    /// A message to `peer` could not be delivered.
    fn report_unreachable(&self, peer: PeerId);
}
