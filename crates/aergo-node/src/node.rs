//! Relay node: an in-memory chain and mempool wired to the P2P service.
//!
//! The chain keeps only the blocks that extend its best block and the
//! mempool only remembers recent transactions. Everything either accepts
//! from a peer is announced back to the network.

use crate::config::{ChainConfig, NodeConfig};
use aergo_p2p::{
    ActorService, Block, BlockHeader, BlockId, ChainAccessor, NetworkError, NetworkResult, NodeKey,
    P2PHandle, P2PService, PeerEventListener, PeerId, RemotePeer, ServiceDeps, Tx, TxId,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Chain that starts at a genesis block and grows by relayed blocks.
pub struct RelayChain {
    chain_id: Bytes,
    blocks: RwLock<Vec<Block>>,
}

impl RelayChain {
    pub fn genesis(config: &ChainConfig) -> Self {
        let chain_id = Bytes::from(config.chain_id.clone().into_bytes());
        let genesis = Block::new(
            BlockHeader {
                chain_id: chain_id.clone(),
                prev_block_hash: BlockId::default(),
                block_no: 0,
                timestamp: config.genesis_timestamp,
            },
            Vec::new(),
        );
        Self {
            chain_id,
            blocks: RwLock::new(vec![genesis]),
        }
    }

    pub fn height(&self) -> u64 {
        self.blocks.read().len() as u64 - 1
    }

    /// Append `block` if it extends the best block.
    pub fn try_append(&self, block: &Block) -> bool {
        let mut blocks = self.blocks.write();
        let Some(best) = blocks.last() else {
            return false;
        };
        if block.header.prev_block_hash != best.hash || block.block_no() != best.block_no() + 1 {
            return false;
        }
        blocks.push(block.clone());
        true
    }
}

impl ChainAccessor for RelayChain {
    fn best_block(&self) -> NetworkResult<Block> {
        self.blocks
            .read()
            .last()
            .cloned()
            .ok_or_else(|| NetworkError::ActorUnavailable("relay chain".into()))
    }

    fn chain_id(&self, _block_no: u64) -> Bytes {
        self.chain_id.clone()
    }

    fn genesis_hash(&self) -> BlockId {
        self.blocks
            .read()
            .first()
            .map(|b| b.hash)
            .unwrap_or_default()
    }

    fn get_block(&self, hash: &BlockId) -> NetworkResult<Option<Block>> {
        Ok(self.blocks.read().iter().rev().find(|b| &b.hash == hash).cloned())
    }

    fn get_hash_by_no(&self, block_no: u64) -> NetworkResult<Option<BlockId>> {
        Ok(self.blocks.read().get(block_no as usize).map(|b| b.hash))
    }
}

/// What the relay accepted and must announce.
#[derive(Debug)]
pub enum RelayEvent {
    BlockAdded(Block),
    TxAccepted(Tx),
}

/// Chain service, mempool and vote source of the relay node.
pub struct RelayActor {
    chain: Arc<RelayChain>,
    mempool: Mutex<LruCache<TxId, Tx>>,
    elected: Vec<PeerId>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayActor {
    pub fn new(
        chain: Arc<RelayChain>,
        mempool_size: usize,
        elected: Vec<PeerId>,
    ) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let cap = NonZeroUsize::new(mempool_size).unwrap_or(NonZeroUsize::MIN);
        let actor = Self {
            chain,
            mempool: Mutex::new(LruCache::new(cap)),
            elected,
            events,
        };
        (actor, rx)
    }
}

#[async_trait]
impl ActorService for RelayActor {
    async fn mempool_exist_ex(&self, hashes: &[TxId]) -> NetworkResult<Vec<Option<Tx>>> {
        let mut pool = self.mempool.lock();
        Ok(hashes.iter().map(|h| pool.get(h).cloned()).collect())
    }

    async fn get_elected(&self, count: usize) -> NetworkResult<Vec<PeerId>> {
        Ok(self.elected.iter().take(count).copied().collect())
    }

    fn bp_count(&self) -> usize {
        self.elected.len()
    }

    fn add_block(&self, peer: PeerId, block: Block) {
        if !self.chain.try_append(&block) {
            debug!(peer = %peer.short(), block = %block.hash, no = block.block_no(), "Block does not extend best, ignored");
            return;
        }
        info!(peer = %peer.short(), block = %block.hash, no = block.block_no(), "Relay chain extended");
        let _ = self.events.send(RelayEvent::BlockAdded(block));
    }

    fn mempool_put(&self, tx: Tx) {
        {
            let mut pool = self.mempool.lock();
            if pool.contains(&tx.hash) {
                return;
            }
            pool.put(tx.hash, tx.clone());
        }
        let _ = self.events.send(RelayEvent::TxAccepted(tx));
    }

    fn sync_block_state(&self, peer: PeerId, block_no: u64, block_hash: BlockId) {
        if block_no > self.chain.height() {
            info!(peer = %peer.short(), no = block_no, block = %block_hash, "Peer is ahead of relay chain");
        }
    }
}

/// Logs session lifecycle.
struct PeerLogger;

impl PeerEventListener for PeerLogger {
    fn on_peer_connect(&self, peer: &Arc<RemotePeer>) {
        info!(
            peer = %peer.id().short(),
            role = %peer.accepted_role(),
            outbound = peer.is_outbound(),
            "Peer connected"
        );
    }

    fn on_peer_disconnect(&self, peer: &Arc<RemotePeer>) {
        info!(peer = %peer.id().short(), "Peer disconnected");
    }
}

/// The relay node.
pub struct Node {
    service: P2PService,
    handle: P2PHandle,
    relay: mpsc::UnboundedReceiver<RelayEvent>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let key = NodeKey::load_or_generate(&config.p2p.np_key).context("Failed to load node key")?;
        let chain = Arc::new(RelayChain::genesis(&config.chain));
        let (actor, relay) = RelayActor::new(
            chain.clone(),
            config.chain.mempool_size,
            config.consensus.bp_ids()?,
        );
        let deps = ServiceDeps {
            chain,
            actor: Arc::new(actor),
            raft: None,
            polaris: None,
        };
        let (mut service, handle) = P2PService::new(
            config.p2p,
            key,
            config.consensus.kind,
            config.consensus.enable_bp,
            deps,
        )
        .context("Failed to initialize p2p service")?;
        service.add_peer_listener(Arc::new(PeerLogger));
        Ok(Self {
            service,
            handle,
            relay,
        })
    }

    /// Run until Ctrl-C or until the service ends.
    pub async fn run(self) -> Result<()> {
        let Self {
            service,
            handle,
            mut relay,
        } = self;
        info!(id = %service.self_meta().id, role = %service.self_meta().role, "Starting relay node");
        let mut service_task = tokio::spawn(service.run());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    handle.stop().await?;
                    break;
                }
                result = &mut service_task => {
                    return match result {
                        Ok(r) => r.context("P2P service failed"),
                        Err(e) => Err(e).context("P2P service panicked"),
                    };
                }
                Some(event) = relay.recv() => {
                    if let Err(e) = announce(&handle, event).await {
                        error!(error = %e, "Failed to announce relayed item");
                    }
                }
            }
        }

        service_task.await.context("P2P service panicked")??;
        Ok(())
    }
}

async fn announce(handle: &P2PHandle, event: RelayEvent) -> NetworkResult<()> {
    match event {
        RelayEvent::BlockAdded(block) => handle.notify_new_block(block).await,
        RelayEvent::TxAccepted(tx) => handle.notify_new_txs(vec![tx]).await,
    }
}
