//! Test harness for integration tests.
//!
//! Provides an in-memory chain and actor, duplex stream pairs and a
//! helper that runs a full P2P service on a loopback port.

use aergo_p2p::handshake::Handshaker;
use aergo_p2p::peer::{LastStatus, RemoteInfo, SessionEnv};
use aergo_p2p::tracer::{TracerTask, TxNoticeTracer};
use aergo_p2p::types::{to_multiaddr, ConnectionInfo};
use aergo_p2p::{
    ActorService, Block, BlockHeader, BlockId, BoxStream, ChainAccessor, CertificateManager,
    ConsensusKind, HandshakeResult, MsgOrderFactory, NetAddr, NetworkError, NetworkResult,
    NodeKey, P2PCommand, P2PConfig, P2PHandle, P2PService, PeerId, PeerInfo, PeerMeta, PeerRole,
    PeerZone, RemotePeer, ServiceDeps, Tx, TxId,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Chain id shared by every test chain.
pub const TEST_CHAIN_ID: &[u8] = b"aergo-test";

/// Linear in-memory chain.
pub struct MockChain {
    blocks: RwLock<Vec<Block>>,
}

impl MockChain {
    /// Genesis plus `len - 1` blocks, one tx each.
    pub fn new(len: u64) -> Self {
        let chain = Self {
            blocks: RwLock::new(vec![genesis()]),
        };
        for _ in 1..len.max(1) {
            let next = chain.next_block();
            chain.append(next);
        }
        chain
    }

    /// Block extending the current best.
    pub fn next_block(&self) -> Block {
        let blocks = self.blocks.read();
        let best = &blocks[blocks.len() - 1];
        child_of(best, &format!("tx-{}", best.block_no() + 1))
    }

    pub fn append(&self, block: Block) {
        self.blocks.write().push(block);
    }

    pub fn block(&self, no: u64) -> Block {
        self.blocks.read()[no as usize].clone()
    }
}

/// Genesis block every mock chain starts from.
pub fn genesis() -> Block {
    Block::new(
        BlockHeader {
            chain_id: Bytes::from_static(TEST_CHAIN_ID),
            prev_block_hash: BlockId::default(),
            block_no: 0,
            timestamp: 0,
        },
        Vec::new(),
    )
}

/// Block on top of `parent` holding one tx with body `tx`.
pub fn child_of(parent: &Block, tx: &str) -> Block {
    Block::new(
        BlockHeader {
            chain_id: parent.header.chain_id.clone(),
            prev_block_hash: parent.hash,
            block_no: parent.block_no() + 1,
            timestamp: parent.header.timestamp + 1,
        },
        vec![Tx::new(Bytes::from(tx.to_string()))],
    )
}

impl ChainAccessor for MockChain {
    fn best_block(&self) -> NetworkResult<Block> {
        self.blocks
            .read()
            .last()
            .cloned()
            .ok_or_else(|| NetworkError::ActorUnavailable("empty chain".into()))
    }

    fn chain_id(&self, _block_no: u64) -> Bytes {
        Bytes::from_static(TEST_CHAIN_ID)
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

/// Records every post made to the chain service and the mempool.
#[derive(Default)]
pub struct MockActor {
    pub mempool: Mutex<HashMap<TxId, Tx>>,
    pub added_blocks: Mutex<Vec<(PeerId, BlockId)>>,
    pub put_txs: Mutex<Vec<Tx>>,
    pub synced: Mutex<Vec<(PeerId, u64)>>,
    pub elected: Mutex<Vec<PeerId>>,
}

impl MockActor {
    pub fn with_txs(txs: &[Tx]) -> Self {
        let actor = Self::default();
        actor
            .mempool
            .lock()
            .extend(txs.iter().map(|t| (t.hash, t.clone())));
        actor
    }

    pub fn added_count(&self, hash: &BlockId) -> usize {
        self.added_blocks
            .lock()
            .iter()
            .filter(|(_, h)| h == hash)
            .count()
    }
}

#[async_trait]
impl ActorService for MockActor {
    async fn mempool_exist_ex(&self, hashes: &[TxId]) -> NetworkResult<Vec<Option<Tx>>> {
        let pool = self.mempool.lock();
        Ok(hashes.iter().map(|h| pool.get(h).cloned()).collect())
    }

    async fn get_elected(&self, count: usize) -> NetworkResult<Vec<PeerId>> {
        Ok(self.elected.lock().iter().take(count).copied().collect())
    }

    fn bp_count(&self) -> usize {
        self.elected.lock().len()
    }

    fn add_block(&self, peer: PeerId, block: Block) {
        self.added_blocks.lock().push((peer, block.hash));
    }

    fn mempool_put(&self, tx: Tx) {
        self.mempool.lock().insert(tx.hash, tx.clone());
        self.put_txs.lock().push(tx);
    }

    fn sync_block_state(&self, peer: PeerId, block_no: u64, _block_hash: BlockId) {
        self.synced.lock().push((peer, block_no));
    }
}

/// Certificate manager holding nothing.
pub struct NoCerts;

impl CertificateManager for NoCerts {}

/// Two ends of an in-memory byte stream.
pub fn duplex_pair() -> (BoxStream, BoxStream) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (Box::new(a), Box::new(b))
}

pub fn loopback_meta(key: &NodeKey, port: u16) -> PeerMeta {
    let mut meta = PeerMeta::with_id(key.id());
    meta.addresses = vec![NetAddr::new("127.0.0.1", port)];
    meta
}

/// Handshaker for `key` over `chain` with the main magic.
pub fn handshaker(key: &NodeKey, chain: Arc<dyn ChainAccessor>) -> Handshaker {
    Handshaker::new(
        aergo_p2p::MAGIC_MAIN,
        loopback_meta(key, aergo_p2p::DEFAULT_PORT),
        chain,
        Arc::new(NoCerts),
    )
}

/// Session environment plus the receiving ends it feeds.
pub struct SessionFixture {
    pub env: Arc<SessionEnv>,
    pub removed: mpsc::UnboundedReceiver<Arc<RemotePeer>>,
    pub commands: mpsc::Receiver<P2PCommand>,
    pub tracer: TracerTask,
}

pub fn session_fixture(chain: Arc<dyn ChainAccessor>) -> SessionFixture {
    let (commands_tx, commands) = mpsc::channel(64);
    let (tracer, tracer_task) = TxNoticeTracer::new(commands_tx);
    let (removed_tx, removed) = mpsc::unbounded_channel();
    let env = Arc::new(SessionEnv {
        factory: MsgOrderFactory::new(),
        chain,
        tracer,
        raft: None,
        removed: removed_tx,
    });
    SessionFixture {
        env,
        removed,
        commands,
        tracer: tracer_task,
    }
}

/// Session built from a finished handshake, not started yet.
pub fn peer_from_handshake(
    result: &HandshakeResult,
    outbound: bool,
    env: Arc<SessionEnv>,
) -> Arc<RemotePeer> {
    let remote = result
        .meta
        .primary_addr()
        .cloned()
        .unwrap_or_else(|| NetAddr::new("127.0.0.1", aergo_p2p::DEFAULT_PORT));
    let info = RemoteInfo {
        accepted_role: PeerRole::Watcher,
        meta: result.meta.clone(),
        connection: ConnectionInfo { remote, outbound },
        zone: PeerZone::Internal,
        certificates: result.certificates.clone(),
        hidden: result.hidden,
        version: result.version,
    };
    let status = LastStatus {
        block_hash: result.best_hash,
        block_no: result.best_no,
    };
    RemotePeer::new(info, status, env)
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A loopback port nobody listens on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("Failed to find a free port")
}

/// Static-mode config listening on `port`.
pub fn node_config(port: u16, add_peers: Vec<String>) -> P2PConfig {
    P2PConfig {
        net_protocol_addr: "127.0.0.1".to_string(),
        net_protocol_port: port,
        np_add_peers: add_peers,
        np_discover_peers: false,
        ..P2PConfig::default()
    }
}

/// A P2P service running on a loopback port.
pub struct TestNode {
    pub id: PeerId,
    pub port: u16,
    pub handle: P2PHandle,
    pub chain: Arc<MockChain>,
    pub actor: Arc<MockActor>,
    task: JoinHandle<NetworkResult<()>>,
}

impl TestNode {
    pub fn start(config: P2PConfig, chain: Arc<MockChain>, actor: Arc<MockActor>) -> Self {
        Self::start_with_key(NodeKey::generate(), config, chain, actor)
    }

    pub fn start_with_key(
        key: NodeKey,
        config: P2PConfig,
        chain: Arc<MockChain>,
        actor: Arc<MockActor>,
    ) -> Self {
        let id = key.id();
        let port = config.net_protocol_port;
        let deps = ServiceDeps {
            chain: chain.clone(),
            actor: actor.clone(),
            raft: None,
            polaris: None,
        };
        let (service, handle) = P2PService::new(config, key, ConsensusKind::Raft, false, deps)
            .expect("Failed to create p2p service");
        let task = tokio::spawn(service.run());
        Self {
            id,
            port,
            handle,
            chain,
            actor,
            task,
        }
    }

    /// A watcher on a fresh port with default chain and actor.
    pub fn spawn(add_peers: Vec<String>) -> Self {
        Self::start(
            node_config(free_port(), add_peers),
            Arc::new(MockChain::new(3)),
            Arc::new(MockActor::default()),
        )
    }

    pub fn multiaddr(&self) -> String {
        to_multiaddr(&NetAddr::new("127.0.0.1", self.port), &self.id)
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.handle.get_peers().await.unwrap_or_default()
    }

    /// Wait until `id` is a running session of this node.
    pub async fn wait_connected(&self, id: PeerId) -> bool {
        let node = self;
        wait_until(Duration::from_secs(5), || async move {
            node.peers()
                .await
                .iter()
                .any(|p| p.meta.id == id && p.state == aergo_p2p::PeerState::Running)
        })
        .await
    }

    pub async fn stop(self) {
        let _ = self.handle.stop().await;
        let _ = self.task.await;
    }
}
