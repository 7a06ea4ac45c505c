//! P2P service root.
//!
//! `P2PService` wires the managers together and runs the command loop.
//! The chain, the mempool and the internal components all talk to it
//! through the same bounded command channel, exposed as [`P2PHandle`].

use crate::actor::{ActorService, ChainAccessor, RaftAccessor};
use crate::broadcast;
use crate::cert::{new_certificate_manager, CertificateManager, RawCertificate, CERT_SWEEP_INTERVAL};
use crate::config::{ConsensusKind, P2PConfig};
use crate::finder::PolarisClient;
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::handshake::{Handshaker, P2PVersion};
use crate::key::NodeKey;
use crate::manager::{ManagerSetup, PeerEventListener, PeerManager, PeerManagerHandle};
use crate::message::{
    AddressesRequest, CertificateRenewedNotice, GetBlockRequest, IssueCertificateRequest,
    RaftWrapperMessage, SubProtocol,
};
use crate::order::MsgOrderFactory;
use crate::peer::{LastStatus, PeerState, RemotePeer, SessionEnv};
use crate::role::{DposRoleManager, RaftRoleManager, RoleManager};
use crate::sync::{SyncManager, TxSyncTask};
use crate::tracer::{TracerTask, TxNoticeTracer};
use crate::transport;
use crate::types::{
    now_unix_nanos, Block, BlockId, NetAddr, PeerId, PeerMeta, PeerRole, PeerZone, Tx, TxId,
};
use crate::{NetworkError, NetworkResult, NODE_VERSION};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the service command queue.
pub const COMMAND_QUEUE_SIZE: usize = 1000;

/// Requests handled by the service loop.
#[derive(Debug)]
pub enum P2PCommand {
    /// Announce a block accepted by the local chain.
    NotifyNewBlock { block: Block },
    /// Push a block this node produced.
    NotifyBlockProduced { producer: PeerId, block: Block },
    /// Announce txs accepted by the local mempool.
    NotifyNewTxs { txs: Vec<Tx> },
    /// Announce again hashes no peer received.
    RetryTxNotice { hashes: Vec<TxId> },
    /// Fetch blocks from one peer.
    GetBlockInfos { to: PeerId, hashes: Vec<BlockId> },
    /// Ask one peer for addresses it knows.
    GetAddresses { to: PeerId, size: u32 },
    GetPeers { reply: oneshot::Sender<Vec<PeerInfo>> },
    SendRaft { to: PeerId, msg: RaftWrapperMessage },
    /// Producer set changed.
    UpdateBp { added: Vec<PeerId>, removed: Vec<PeerId> },
    /// Ask a producer for an agent certificate.
    IssueCertificate { bp_id: PeerId },
    /// Tell connected peers about a fresh agent certificate.
    NotifyCertRenewed { certificate: RawCertificate },
    Stop,
}

/// Snapshot of one connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub meta: PeerMeta,
    pub accepted_role: PeerRole,
    pub outbound: bool,
    pub hidden: bool,
    pub zone: PeerZone,
    pub version: P2PVersion,
    pub state: PeerState,
    pub last_status: LastStatus,
}

impl From<&RemotePeer> for PeerInfo {
    fn from(peer: &RemotePeer) -> Self {
        let info = peer.remote_info();
        Self {
            meta: info.meta,
            accepted_role: info.accepted_role,
            outbound: info.connection.outbound,
            hidden: info.hidden,
            zone: info.zone,
            version: info.version,
            state: peer.state(),
            last_status: peer.last_status(),
        }
    }
}

/// Cloneable command handle of a running service.
#[derive(Clone, Debug)]
pub struct P2PHandle {
    commands: mpsc::Sender<P2PCommand>,
}

impl P2PHandle {
    async fn send(&self, cmd: P2PCommand) -> NetworkResult<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| NetworkError::ActorUnavailable("p2p service".into()))
    }

    pub async fn notify_new_block(&self, block: Block) -> NetworkResult<()> {
        self.send(P2PCommand::NotifyNewBlock { block }).await
    }

    pub async fn notify_block_produced(&self, producer: PeerId, block: Block) -> NetworkResult<()> {
        self.send(P2PCommand::NotifyBlockProduced { producer, block })
            .await
    }

    pub async fn notify_new_txs(&self, txs: Vec<Tx>) -> NetworkResult<()> {
        self.send(P2PCommand::NotifyNewTxs { txs }).await
    }

    pub async fn get_block_infos(&self, to: PeerId, hashes: Vec<BlockId>) -> NetworkResult<()> {
        self.send(P2PCommand::GetBlockInfos { to, hashes }).await
    }

    pub async fn get_addresses(&self, to: PeerId, size: u32) -> NetworkResult<()> {
        self.send(P2PCommand::GetAddresses { to, size }).await
    }

    pub async fn get_peers(&self) -> NetworkResult<Vec<PeerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(P2PCommand::GetPeers { reply }).await?;
        rx.await
            .map_err(|_| NetworkError::ActorUnavailable("p2p service".into()))
    }

    pub async fn send_raft(&self, to: PeerId, msg: RaftWrapperMessage) -> NetworkResult<()> {
        self.send(P2PCommand::SendRaft { to, msg }).await
    }

    pub async fn update_bp(&self, added: Vec<PeerId>, removed: Vec<PeerId>) -> NetworkResult<()> {
        self.send(P2PCommand::UpdateBp { added, removed }).await
    }

    /// Ask the service to stop. Stopping a stopped service is a no-op.
    pub async fn stop(&self) -> NetworkResult<()> {
        if self.commands.send(P2PCommand::Stop).await.is_err() {
            debug!("P2P service already stopped");
        }
        Ok(())
    }
}

/// External services the P2P layer depends on.
pub struct ServiceDeps {
    pub chain: Arc<dyn ChainAccessor>,
    pub actor: Arc<dyn ActorService>,
    pub raft: Option<Arc<dyn RaftAccessor>>,
    pub polaris: Option<Arc<dyn PolarisClient>>,
}

/// State the command loop acts upon.
struct Dispatcher {
    self_meta: PeerMeta,
    factory: MsgOrderFactory,
    role: Arc<dyn RoleManager>,
    sync: Arc<SyncManager>,
    tracer: TxNoticeTracer,
    peers: PeerManagerHandle,
    raft: Option<Arc<dyn RaftAccessor>>,
}

pub struct P2PService {
    dispatcher: Dispatcher,
    manager: PeerManager,
    certs: Arc<dyn CertificateManager>,
    actor: Arc<dyn ActorService>,
    dpos: Option<Arc<DposRoleManager>>,
    tracer_task: TracerTask,
    tx_task: TxSyncTask,
    bind: NetAddr,
    commands: mpsc::Receiver<P2PCommand>,
    cancel: CancellationToken,
}

impl P2PService {
    pub fn new(
        config: P2PConfig,
        key: NodeKey,
        consensus: ConsensusKind,
        enable_bp: bool,
        deps: ServiceDeps,
    ) -> NetworkResult<(Self, P2PHandle)> {
        config.validate(enable_bp)?;
        let self_role = config.self_role(enable_bp)?;
        let producers = config.producer_ids()?;
        let self_meta = PeerMeta {
            id: key.id(),
            addresses: vec![config.advertised_addr()],
            role: self_role,
            producer_ids: producers.clone(),
            version: NODE_VERSION.to_string(),
            hidden: !config.np_expose_self,
            designated: false,
        };
        info!(
            id = %self_meta.id,
            role = %self_role,
            addr = %config.advertised_addr(),
            ?consensus,
            "Initializing p2p service"
        );

        let (cmd_tx, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let factory = MsgOrderFactory::new();
        let (dpos, role): (Option<Arc<DposRoleManager>>, Arc<dyn RoleManager>) = match consensus {
            ConsensusKind::Dpos => {
                let dpos = Arc::new(DposRoleManager::new(self_role, producers));
                (Some(dpos.clone()), dpos)
            }
            ConsensusKind::Raft => (None, Arc::new(RaftRoleManager::new(self_role))),
        };
        let certs = new_certificate_manager(self_meta.clone(), *key.secret(), cmd_tx.clone());
        let handshaker = Arc::new(Handshaker::new(
            config.chain_magic,
            self_meta.clone(),
            deps.chain.clone(),
            certs.clone(),
        ));
        let (tracer, tracer_task) = TxNoticeTracer::new(cmd_tx.clone());
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();
        let env = Arc::new(SessionEnv {
            factory,
            chain: deps.chain.clone(),
            tracer: tracer.clone(),
            raft: deps.raft.clone(),
            removed: removed_tx,
        });

        let (peers, events) = PeerManagerHandle::detached();
        let (sync, tx_task) = SyncManager::new(
            deps.chain.clone(),
            deps.actor.clone(),
            peers.clone(),
            factory,
            cmd_tx.clone(),
        );
        let sync = Arc::new(sync);
        let ctx = Arc::new(HandlerContext {
            self_meta: self_meta.clone(),
            factory,
            chain: deps.chain.clone(),
            actor: deps.actor.clone(),
            sync: sync.clone(),
            certs: certs.clone(),
            role: role.clone(),
            peers: peers.clone(),
            raft: deps.raft.clone(),
        });
        let bind = config.bind_addr();
        let setup = ManagerSetup {
            key,
            config,
            handshaker,
            env,
            handlers: HandlerRegistry::standard(ctx),
            role: role.clone(),
            certs: certs.clone(),
            actor: deps.actor.clone(),
            commands: cmd_tx.clone(),
            polaris: deps.polaris,
        };
        let manager = PeerManager::new(setup, peers.clone(), events, removed_rx)?;

        let service = Self {
            dispatcher: Dispatcher {
                self_meta,
                factory,
                role,
                sync,
                tracer,
                peers,
                raft: deps.raft,
            },
            manager,
            certs,
            actor: deps.actor,
            dpos,
            tracer_task,
            tx_task,
            bind,
            commands,
            cancel: CancellationToken::new(),
        };
        Ok((service, P2PHandle { commands: cmd_tx }))
    }

    pub fn self_meta(&self) -> &PeerMeta {
        &self.dispatcher.self_meta
    }

    /// Observe peer registration and removal. Call before [`run`](Self::run).
    pub fn add_peer_listener(&mut self, listener: Arc<dyn PeerEventListener>) {
        self.manager.add_listener(listener);
    }

    /// Token that stops the service when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind the listener, start the background tasks and serve commands
    /// until stopped.
    pub async fn run(self) -> NetworkResult<()> {
        let Self {
            dispatcher,
            manager,
            certs,
            actor,
            dpos,
            tracer_task,
            tx_task,
            bind,
            mut commands,
            cancel,
        } = self;

        let listener = transport::listen(&bind).await?;
        info!(addr = %bind, "P2P listener started");

        tokio::spawn(tracer_task.run(cancel.clone()));
        tokio::spawn(tx_task.run(cancel.clone()));
        if let Some(dpos) = dpos {
            tokio::spawn(dpos.run_refresh(actor, dispatcher.peers.clone(), cancel.clone()));
        }
        tokio::spawn(run_cert_sweep(certs, cancel.clone()));
        let manager_task = tokio::spawn(manager.run(Some(listener), cancel.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(P2PCommand::Stop) | None => break,
                    Some(cmd) => dispatcher.handle(cmd),
                },
            }
        }

        info!("Stopping p2p service");
        cancel.cancel();
        if let Err(e) = manager_task.await {
            warn!(error = %e, "Peer manager task failed");
        }
        info!("P2P service stopped");
        Ok(())
    }
}

async fn run_cert_sweep(certs: Arc<dyn CertificateManager>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval_at(Instant::now() + CERT_SWEEP_INTERVAL, CERT_SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => certs.sweep(now_unix_nanos()),
        }
    }
}

impl Dispatcher {
    fn handle(&self, cmd: P2PCommand) {
        match cmd {
            P2PCommand::NotifyNewBlock { block } => {
                broadcast::notify_new_block(&self.factory, self.role.as_ref(), self.peers.get_peers(), &block);
            }
            P2PCommand::NotifyBlockProduced { producer, block } => {
                broadcast::notify_block_produced(
                    &self.factory,
                    self.role.as_ref(),
                    self.peers.get_peers(),
                    producer,
                    &block,
                );
            }
            P2PCommand::NotifyNewTxs { txs } => {
                self.sync.register_txs(&txs);
                let hashes = txs.iter().map(|t| t.hash).collect();
                let sent = broadcast::notify_new_txs(&self.tracer, self.peers.get_peers(), hashes);
                debug!(txs = txs.len(), peers = sent, "Noticed new txs");
            }
            P2PCommand::RetryTxNotice { hashes } => {
                let count = hashes.len();
                let sent = broadcast::notify_new_txs(&self.tracer, self.peers.get_peers(), hashes);
                debug!(txs = count, peers = sent, "Retried tx notice");
            }
            P2PCommand::GetBlockInfos { to, hashes } => {
                self.request(to, SubProtocol::GET_BLOCKS_REQUEST, &GetBlockRequest { hashes });
            }
            P2PCommand::GetAddresses { to, size } => {
                let req = AddressesRequest {
                    sender: self.self_meta.to_peer_address(),
                    max_size: size,
                };
                self.request(to, SubProtocol::ADDRESSES_REQUEST, &req);
            }
            P2PCommand::GetPeers { reply } => {
                let infos = self
                    .peers
                    .get_peers()
                    .iter()
                    .map(|p| PeerInfo::from(p.as_ref()))
                    .collect();
                if reply.send(infos).is_err() {
                    debug!("Peer list requester is gone");
                }
            }
            P2PCommand::SendRaft { to, msg } => self.send_raft(to, msg),
            P2PCommand::UpdateBp { added, removed } => {
                let changes = self.role.update_bp(&added, &removed);
                self.peers.update_peer_roles(&changes);
            }
            P2PCommand::IssueCertificate { bp_id } => {
                self.request(bp_id, SubProtocol::ISSUE_CERT_REQUEST, &IssueCertificateRequest);
            }
            P2PCommand::NotifyCertRenewed { certificate } => {
                let notice = CertificateRenewedNotice { certificate };
                if let Some(order) = self.factory.new_notice(SubProtocol::CERT_RENEWED_NOTICE, &notice) {
                    let result = broadcast::fan_out(&order, &self.peers.get_peers(), None);
                    debug!(sent = result.sent, "Announced renewed certificate");
                }
            }
            P2PCommand::Stop => {}
        }
    }

    fn request<P: crate::wire::Payload>(&self, to: PeerId, protocol: SubProtocol, body: &P) {
        let Some(peer) = self.peers.get_peer(&to) else {
            debug!(peer = %to.short(), %protocol, "Peer not connected, request dropped");
            return;
        };
        if let Some(order) = self.factory.new_request(protocol, body) {
            peer.send_message(order);
        }
    }

    fn send_raft(&self, to: PeerId, msg: RaftWrapperMessage) {
        let peer = self.peers.get_peer(&to).filter(|p| p.is_running());
        match (peer, self.factory.new_raft(&msg)) {
            (Some(peer), Some(order)) => peer.send_message(order),
            _ => {
                debug!(peer = %to.short(), "Raft peer unreachable");
                if let Some(raft) = &self.raft {
                    raft.report_unreachable(to);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TestActor, TestChain};
    use crate::types::to_multiaddr;
    use std::time::Duration;

    fn deps() -> ServiceDeps {
        ServiceDeps {
            chain: Arc::new(TestChain::new(3)),
            actor: Arc::new(TestActor::default()),
            raft: None,
            polaris: None,
        }
    }

    fn config(port: u16, add_peers: Vec<String>) -> P2PConfig {
        P2PConfig {
            net_protocol_port: port,
            np_add_peers: add_peers,
            np_discover_peers: false,
            ..P2PConfig::default()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap()
    }

    #[test]
    fn test_agent_without_producers_rejected() {
        let mut cfg = config(free_port(), Vec::new());
        cfg.peer_role = "agent".into();
        let result = P2PService::new(cfg, NodeKey::generate(), ConsensusKind::Raft, false, deps());
        assert!(matches!(result, Err(NetworkError::Config(_))));
    }

    #[tokio::test]
    async fn test_two_services_connect_and_stop() {
        let port_b = free_port();
        let key_b = NodeKey::generate();
        let id_b = key_b.id();
        let (svc_b, handle_b) =
            P2PService::new(config(port_b, Vec::new()), key_b, ConsensusKind::Raft, false, deps()).unwrap();
        let task_b = tokio::spawn(svc_b.run());

        let target = to_multiaddr(&NetAddr::new("127.0.0.1", port_b), &id_b);
        let (svc_a, handle_a) = P2PService::new(
            config(free_port(), vec![target]),
            NodeKey::generate(),
            ConsensusKind::Raft,
            false,
            deps(),
        )
        .unwrap();
        let self_a = svc_a.self_meta().id;
        let task_a = tokio::spawn(svc_a.run());

        let mut connected = false;
        for _ in 0..200 {
            let peers = handle_a.get_peers().await.unwrap();
            if peers.iter().any(|p| p.meta.id == id_b && p.state == PeerState::Running) {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(connected);
        let mut on_b = Vec::new();
        for _ in 0..200 {
            on_b = handle_b.get_peers().await.unwrap();
            if !on_b.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(on_b.len(), 1);
        assert_eq!(on_b[0].meta.id, self_a);
        assert!(!on_b[0].outbound);

        handle_a.stop().await.unwrap();
        handle_b.stop().await.unwrap();
        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
        assert!(handle_a.get_peers().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (svc, handle) = P2PService::new(
            config(free_port(), Vec::new()),
            NodeKey::generate(),
            ConsensusKind::Raft,
            false,
            deps(),
        )
        .unwrap();
        let task = tokio::spawn(svc.run());
        handle.stop().await.unwrap();
        task.await.unwrap().unwrap();

        handle.stop().await.unwrap();
        handle.clone().stop().await.unwrap();
        assert!(handle.get_peers().await.is_err());
    }
}
