//! Shared fixtures for unit tests.

use crate::actor::{ActorService, ChainAccessor};
use crate::handshake::P2PVersion;
use crate::key::NodeKey;
use crate::order::MsgOrderFactory;
use crate::peer::{RemoteInfo, RemotePeer, SessionEnv};
use crate::service::P2PCommand;
use crate::tracer::{TracerTask, TxNoticeTracer};
use crate::types::{
    Block, BlockHeader, BlockId, ConnectionInfo, NetAddr, PeerId, PeerMeta, PeerRole, PeerZone,
    Tx, TxId,
};
use crate::{NetworkError, NetworkResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Linear in-memory chain starting at a genesis block.
pub struct TestChain {
    pub chain_id: Bytes,
    blocks: RwLock<Vec<Block>>,
}

impl TestChain {
    pub fn new(len: u64) -> Self {
        let chain_id = Bytes::from_static(b"testnet");
        let mut blocks: Vec<Block> = Vec::new();
        for no in 0..len.max(1) {
            let prev = blocks.last().map(|b| b.hash).unwrap_or_default();
            blocks.push(Block::new(
                BlockHeader {
                    chain_id: chain_id.clone(),
                    prev_block_hash: prev,
                    block_no: no,
                    timestamp: no as i64,
                },
                vec![Tx::new(Bytes::from(format!("tx-{}", no)))],
            ));
        }
        Self {
            chain_id,
            blocks: RwLock::new(blocks),
        }
    }

    pub fn block(&self, no: u64) -> Block {
        self.blocks.read()[no as usize].clone()
    }
}

impl ChainAccessor for TestChain {
    fn best_block(&self) -> NetworkResult<Block> {
        self.blocks
            .read()
            .last()
            .cloned()
            .ok_or_else(|| NetworkError::ActorUnavailable("empty chain".into()))
    }

    fn chain_id(&self, _block_no: u64) -> Bytes {
        self.chain_id.clone()
    }

    fn genesis_hash(&self) -> BlockId {
        self.blocks.read()[0].hash
    }

    fn get_block(&self, hash: &BlockId) -> NetworkResult<Option<Block>> {
        Ok(self.blocks.read().iter().find(|b| &b.hash == hash).cloned())
    }

    fn get_hash_by_no(&self, block_no: u64) -> NetworkResult<Option<BlockId>> {
        Ok(self.blocks.read().get(block_no as usize).map(|b| b.hash))
    }
}

/// Records the posts made to the external services.
#[derive(Default)]
pub struct TestActor {
    pub mempool: Mutex<HashMap<TxId, Tx>>,
    pub added_blocks: Mutex<Vec<(PeerId, BlockId)>>,
    pub put_txs: Mutex<Vec<Tx>>,
    pub synced: Mutex<Vec<(PeerId, u64)>>,
    pub elected: Mutex<Vec<PeerId>>,
    pub bp_count: usize,
}

#[async_trait]
impl ActorService for TestActor {
    async fn mempool_exist_ex(&self, hashes: &[TxId]) -> NetworkResult<Vec<Option<Tx>>> {
        let pool = self.mempool.lock();
        Ok(hashes.iter().map(|h| pool.get(h).cloned()).collect())
    }

    async fn get_elected(&self, count: usize) -> NetworkResult<Vec<PeerId>> {
        Ok(self.elected.lock().iter().take(count).copied().collect())
    }

    fn bp_count(&self) -> usize {
        self.bp_count
    }

    fn add_block(&self, peer: PeerId, block: Block) {
        self.added_blocks.lock().push((peer, block.hash));
    }

    fn mempool_put(&self, tx: Tx) {
        self.put_txs.lock().push(tx);
    }

    fn sync_block_state(&self, peer: PeerId, block_no: u64, _block_hash: BlockId) {
        self.synced.lock().push((peer, block_no));
    }
}

pub struct TestEnv {
    pub env: Arc<SessionEnv>,
    pub chain: Arc<TestChain>,
    pub removed: mpsc::UnboundedReceiver<Arc<RemotePeer>>,
    pub commands: mpsc::Receiver<P2PCommand>,
    pub tracer: TracerTask,
}

pub fn test_env() -> TestEnv {
    let chain = Arc::new(TestChain::new(4));
    let (commands_tx, commands) = mpsc::channel(64);
    let (tracer, tracer_task) = TxNoticeTracer::new(commands_tx);
    let (removed_tx, removed) = mpsc::unbounded_channel();
    let env = Arc::new(SessionEnv {
        factory: MsgOrderFactory::new(),
        chain: chain.clone(),
        tracer,
        raft: None,
        removed: removed_tx,
    });
    TestEnv {
        env,
        chain,
        removed,
        commands,
        tracer: tracer_task,
    }
}

pub fn meta_with_role(id: PeerId, role: PeerRole) -> PeerMeta {
    let mut meta = PeerMeta::with_id(id);
    meta.role = role;
    meta.addresses = vec![NetAddr::new("10.0.0.2", 7846)];
    meta
}

pub fn remote_info_of(meta: PeerMeta) -> RemoteInfo {
    RemoteInfo {
        accepted_role: meta.role,
        meta,
        connection: ConnectionInfo {
            remote: NetAddr::new("10.0.0.2", 7846),
            outbound: true,
        },
        zone: PeerZone::External,
        certificates: Vec::new(),
        hidden: false,
        version: P2PVersion::V200,
    }
}

pub fn remote_info() -> RemoteInfo {
    remote_info_of(meta_with_role(NodeKey::generate().id(), PeerRole::Watcher))
}
