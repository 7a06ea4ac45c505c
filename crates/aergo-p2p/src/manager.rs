//! Peer lifecycle management.
//!
//! A single event loop owns the waiting pool, the finder and every
//! registration decision. Other components only read the connected peer
//! map through a [`PeerManagerHandle`] and feed the loop with events.

use crate::actor::ActorService;
use crate::cert::CertificateManager;
use crate::codec::BoxStream;
use crate::config::P2PConfig;
use crate::finder::{FinderQueries, PeerFinder, PolarisClient, DISCOVER_INTERVAL, MAX_ADDR_LIST_SIZE_PEER, MAX_ADDR_LIST_SIZE_POLARIS};
use crate::handlers::HandlerRegistry;
use crate::handshake::{HandshakeResult, Handshaker};
use crate::key::NodeKey;
use crate::peer::{LastStatus, RemoteInfo, RemotePeer, SessionEnv};
use crate::role::{RoleManager, RoleModifier};
use crate::service::P2PCommand;
use crate::transport;
use crate::types::{classify_zone, Cidr, ConnectionInfo, PeerId, PeerMeta, PeerRole};
use crate::waiting::WaitingPeerManager;
use crate::{NetworkError, NetworkResult};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the manager event queue.
pub const EVENT_QUEUE_SIZE: usize = 100;

/// Interval of scheduling dials to waiting peers.
pub const CONNECT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to sessions to finish their teardown on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Inputs of the manager loop.
pub enum ManagerEvent {
    /// An inbound connection passed transport authentication.
    Accepted {
        stream: BoxStream,
        remote_id: PeerId,
        conn: ConnectionInfo,
    },
    /// A handshake in either direction succeeded.
    Handshaken {
        conn: ConnectionInfo,
        result: Box<HandshakeResult>,
    },
    /// An outbound dial or its handshake failed.
    DialFailed { id: PeerId, error: NetworkError },
    /// Peers learned from address exchange or the directory service.
    Discovered(Vec<PeerMeta>),
}

/// Observer of session registration and removal.
pub trait PeerEventListener: Send + Sync {
    fn on_peer_connect(&self, peer: &Arc<RemotePeer>);
    fn on_peer_disconnect(&self, peer: &Arc<RemotePeer>);
}

/// Cloneable read access to the connected peers plus the event inlet.
#[derive(Clone)]
pub struct PeerManagerHandle {
    peers: Arc<DashMap<PeerId, Arc<RemotePeer>>>,
    events: mpsc::Sender<ManagerEvent>,
}

impl PeerManagerHandle {
    /// A handle and the event queue a [`PeerManager`] will drain.
    pub fn detached() -> (Self, mpsc::Receiver<ManagerEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let handle = Self {
            peers: Arc::new(DashMap::new()),
            events,
        };
        (handle, rx)
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<Arc<RemotePeer>> {
        self.peers.get(id).map(|e| e.value().clone())
    }

    pub fn get_peers(&self) -> Vec<Arc<RemotePeer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Hand discovered peers to the manager. Dropped when it is backlogged.
    pub fn add_discovered(&self, metas: Vec<PeerMeta>) {
        self.send_event(ManagerEvent::Discovered(metas));
    }

    /// Apply role changes to the connected sessions.
    pub fn update_peer_roles(&self, changes: &[RoleModifier]) {
        for change in changes {
            if let Some(peer) = self.get_peer(&change.id) {
                info!(peer = %change.id.short(), role = %change.role, "Peer role changed");
                peer.set_accepted_role(change.role);
            }
        }
    }

    fn send_event(&self, event: ManagerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Peer manager is busy, event dropped"),
            Err(TrySendError::Closed(_)) => debug!("Peer manager is stopped"),
        }
    }
}

/// Collaborators of the peer manager.
pub struct ManagerSetup {
    pub key: NodeKey,
    pub config: P2PConfig,
    pub handshaker: Arc<Handshaker>,
    pub env: Arc<SessionEnv>,
    pub handlers: HandlerRegistry,
    pub role: Arc<dyn RoleManager>,
    pub certs: Arc<dyn CertificateManager>,
    pub actor: Arc<dyn ActorService>,
    pub commands: mpsc::Sender<P2PCommand>,
    pub polaris: Option<Arc<dyn PolarisClient>>,
}

struct ManagerState {
    key: Arc<NodeKey>,
    self_id: PeerId,
    handshaker: Arc<Handshaker>,
    env: Arc<SessionEnv>,
    handlers: HandlerRegistry,
    role: Arc<dyn RoleManager>,
    certs: Arc<dyn CertificateManager>,
    actor: Arc<dyn ActorService>,
    commands: mpsc::Sender<P2PCommand>,
    handle: PeerManagerHandle,
    waiting: WaitingPeerManager,
    finder: PeerFinder,
    designated: HashSet<PeerId>,
    hidden: HashSet<PeerId>,
    internal_zones: Vec<Cidr>,
    max_peers: usize,
    listeners: Vec<Arc<dyn PeerEventListener>>,
}

pub struct PeerManager {
    state: ManagerState,
    events: mpsc::Receiver<ManagerEvent>,
    removed: mpsc::UnboundedReceiver<Arc<RemotePeer>>,
}

impl PeerManager {
    /// `removed` must be the receiving end of `setup.env.removed`.
    pub fn new(
        setup: ManagerSetup,
        handle: PeerManagerHandle,
        events: mpsc::Receiver<ManagerEvent>,
        removed: mpsc::UnboundedReceiver<Arc<RemotePeer>>,
    ) -> NetworkResult<Self> {
        let config = &setup.config;
        let self_id = setup.key.id();
        let designated_peers = config.designated_peers()?;
        let designated = designated_peers.iter().map(|m| m.id).collect();
        let hidden = config.hidden_peer_ids()?.into_iter().collect();
        let internal_zones = config.internal_cidrs()?;
        let finder = PeerFinder::new(
            designated_peers,
            config.np_discover_peers,
            config.np_peer_pool,
            setup.polaris,
        );
        let state = ManagerState {
            key: Arc::new(setup.key),
            self_id,
            handshaker: setup.handshaker,
            env: setup.env,
            handlers: setup.handlers,
            role: setup.role,
            certs: setup.certs,
            actor: setup.actor,
            commands: setup.commands,
            handle,
            waiting: WaitingPeerManager::new(self_id, config.np_discover_peers, config.np_max_peers),
            finder,
            designated,
            hidden,
            internal_zones,
            max_peers: config.np_max_peers,
            listeners: Vec::new(),
        };
        Ok(Self {
            state,
            events,
            removed,
        })
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PeerEventListener>) {
        self.state.listeners.push(listener);
    }

    /// Run until cancelled, then stop every session.
    pub async fn run(self, listener: Option<TcpListener>, cancel: CancellationToken) {
        let Self {
            mut state,
            mut events,
            mut removed,
        } = self;
        info!(
            id = %state.self_id.short(),
            listening = listener.is_some(),
            designated = state.designated.len(),
            "Peer manager started"
        );
        state.check_and_fill();
        let now = Instant::now();
        let mut connect_tick = tokio::time::interval_at(now, CONNECT_CHECK_INTERVAL);
        connect_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discover_tick = tokio::time::interval_at(now + DISCOVER_INTERVAL, DISCOVER_INTERVAL);
        discover_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => state.handle_event(event),
                Some(peer) = removed.recv() => state.on_removed(peer),
                accepted = accept_next(listener.as_ref()) => match accepted {
                    Ok(stream) => state.spawn_authenticate(stream),
                    Err(e) => warn!(error = %e, "Accept error"),
                },
                _ = discover_tick.tick() => state.check_and_fill(),
                _ = connect_tick.tick() => state.check_and_connect(),
            }
        }

        state.shutdown(&mut removed).await;
    }
}

async fn accept_next(listener: Option<&TcpListener>) -> std::io::Result<TcpStream> {
    match listener {
        Some(l) => l.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

impl ManagerState {
    fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Accepted {
                stream,
                remote_id,
                conn,
            } => self.on_accepted(stream, remote_id, conn),
            ManagerEvent::Handshaken { conn, result } => self.on_handshaken(conn, *result),
            ManagerEvent::DialFailed { id, error } => {
                debug!(peer = %id.short(), error = %error, "Outbound connection failed");
                self.waiting
                    .on_work_done(&id, Err(error.to_string()), Instant::now());
            }
            ManagerEvent::Discovered(metas) => {
                let handle = &self.handle;
                let added = self
                    .waiting
                    .on_discovered(metas, |id| handle.is_connected(id), Instant::now());
                if added > 0 {
                    debug!(added, waiting = self.waiting.len(), "Discovered peers added to waiting pool");
                }
            }
        }
    }

    fn spawn_authenticate(&self, stream: TcpStream) {
        let key = self.key.clone();
        let events = self.handle.events.clone();
        tokio::spawn(async move {
            match transport::accept(stream, &key).await {
                Ok((stream, remote_id, conn)) => {
                    let event = ManagerEvent::Accepted {
                        stream,
                        remote_id,
                        conn,
                    };
                    if events.send(event).await.is_err() {
                        debug!("Peer manager is stopped");
                    }
                }
                Err(e) => debug!(error = %e, "Inbound authentication failed"),
            }
        });
    }

    fn on_accepted(&mut self, stream: BoxStream, remote_id: PeerId, conn: ConnectionInfo) {
        if remote_id == self.self_id {
            debug!("Closing inbound connection from self");
            return;
        }
        // an existing session with the same peer is resolved after the handshake
        if !self.handle.is_connected(&remote_id) && self.handle.peer_count() >= self.max_peers {
            info!(peer = %remote_id.short(), max = self.max_peers, "Too many peers, closing inbound connection");
            return;
        }
        let handshaker = self.handshaker.clone();
        let events = self.handle.events.clone();
        tokio::spawn(async move {
            match handshaker.inbound(stream, remote_id).await {
                Ok(result) => {
                    let event = ManagerEvent::Handshaken {
                        conn,
                        result: Box::new(result),
                    };
                    if events.send(event).await.is_err() {
                        debug!("Peer manager is stopped");
                    }
                }
                Err(e) => info!(peer = %remote_id.short(), error = %e, "Inbound handshake failed"),
            }
        });
    }

    fn on_handshaken(&mut self, conn: ConnectionInfo, result: HandshakeResult) {
        let id = result.meta.id;
        let outbound = conn.outbound;
        let registered = self.try_register(conn, result);
        if outbound {
            self.waiting.on_work_done(&id, registered, Instant::now());
        }
    }

    /// Resolve collisions and start the session.
    fn try_register(&mut self, conn: ConnectionInfo, hs: HandshakeResult) -> Result<(), String> {
        let id = hs.meta.id;
        if let Some(existing) = self.handle.get_peer(&id) {
            if existing.is_outbound() == conn.outbound {
                info!(peer = %id.short(), outbound = conn.outbound, "Duplicate session with same direction, dropping newer");
                return Err("already connected".into());
            }
            // the node with the smaller id keeps the inbound session
            let keep_inbound = self.self_id < id;
            let new_is_kept = conn.outbound != keep_inbound;
            if !new_is_kept {
                info!(peer = %id.short(), outbound = conn.outbound, "Collision resolved in favor of existing session");
                return Err("connection collision".into());
            }
            info!(peer = %id.short(), outbound = conn.outbound, "Collision resolved in favor of new session");
            existing.stop();
            // its removal is ignored once the new session holds the slot
            for listener in &self.listeners {
                listener.on_peer_disconnect(&existing);
            }
        }

        let mut meta = hs.meta;
        meta.designated = self.designated.contains(&id);
        let hidden = self.hidden.contains(&id) || hs.hidden;
        meta.hidden = hidden;
        let zone = classify_zone(conn.remote.ip(), &self.internal_zones);
        let claimed = meta.role;
        let mut info = RemoteInfo {
            meta,
            connection: conn,
            zone,
            accepted_role: PeerRole::Watcher,
            certificates: hs.certificates,
            hidden,
            version: hs.version,
        };
        if self.role.check_role(&info, claimed) {
            info.accepted_role = claimed;
        } else {
            info!(peer = %id.short(), claimed = %claimed, "Claimed role not accepted, treating as watcher");
        }

        let status = LastStatus {
            block_hash: hs.best_hash,
            block_no: hs.best_no,
        };
        let peer = RemotePeer::new(info, status, self.env.clone());
        peer.start(hs.framed, self.handlers.clone());
        self.handle.peers.insert(id, peer.clone());

        let now = Instant::now();
        self.waiting.on_peer_connect(&id);
        self.finder.on_peer_connect(id, now);
        self.certs.on_peer_connect(id);
        self.actor.sync_block_state(id, status.block_no, status.block_hash);
        for listener in &self.listeners {
            listener.on_peer_connect(&peer);
        }
        info!(
            peer = %id.short(),
            version = %peer.remote_info().version,
            peers = self.handle.peer_count(),
            "Peer registered"
        );
        Ok(())
    }

    fn on_removed(&mut self, peer: Arc<RemotePeer>) {
        let id = peer.id();
        if self
            .handle
            .peers
            .remove_if(&id, |_, current| Arc::ptr_eq(current, &peer))
            .is_none()
        {
            debug!(peer = %id.short(), "Replaced session finished");
            return;
        }
        self.waiting.on_peer_disconnect(&peer.meta(), Instant::now());
        self.finder.on_peer_disconnect(&id);
        self.certs.on_peer_disconnect(id);
        for listener in &self.listeners {
            listener.on_peer_disconnect(&peer);
        }
        info!(peer = %id.short(), peers = self.handle.peer_count(), "Peer removed");
    }

    fn check_and_fill(&mut self) {
        let handle = &self.handle;
        let FinderQueries { peers, polaris } =
            self.finder
                .check_and_fill(&mut self.waiting, |id| handle.is_connected(id), Instant::now());
        for to in peers {
            let cmd = P2PCommand::GetAddresses {
                to,
                size: MAX_ADDR_LIST_SIZE_PEER,
            };
            if let Err(e) = self.commands.try_send(cmd) {
                debug!(peer = %to.short(), error = %e, "Failed to request addresses");
            }
        }
        if polaris {
            if let Some(client) = self.finder.polaris() {
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    match client.query_peers(MAX_ADDR_LIST_SIZE_POLARIS).await {
                        Ok(metas) if !metas.is_empty() => handle.add_discovered(metas),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Polaris query failed"),
                    }
                });
            }
        }
    }

    fn check_and_connect(&mut self) {
        let dials = self
            .waiting
            .next_dials(Instant::now(), self.handle.peer_count());
        for meta in dials {
            self.spawn_dial(meta);
        }
    }

    fn spawn_dial(&self, meta: PeerMeta) {
        let key = self.key.clone();
        let handshaker = self.handshaker.clone();
        let events = self.handle.events.clone();
        tokio::spawn(async move {
            let id = meta.id;
            let event = match dial_and_handshake(&key, &handshaker, &meta).await {
                Ok((conn, result)) => ManagerEvent::Handshaken {
                    conn,
                    result: Box::new(result),
                },
                Err(error) => ManagerEvent::DialFailed { id, error },
            };
            if events.send(event).await.is_err() {
                debug!(peer = %id.short(), "Peer manager is stopped");
            }
        });
    }

    async fn shutdown(&mut self, removed: &mut mpsc::UnboundedReceiver<Arc<RemotePeer>>) {
        info!(peers = self.handle.peer_count(), "Stopping peer manager");
        for peer in self.handle.get_peers() {
            peer.stop();
        }
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while !self.handle.peers.is_empty() {
            match tokio::time::timeout_at(deadline, removed.recv()).await {
                Ok(Some(peer)) => {
                    self.handle
                        .peers
                        .remove_if(&peer.id(), |_, current| Arc::ptr_eq(current, &peer));
                }
                _ => break,
            }
        }
        self.handle.peers.clear();
        info!("Peer manager stopped");
    }
}

async fn dial_and_handshake(
    key: &NodeKey,
    handshaker: &Handshaker,
    meta: &PeerMeta,
) -> NetworkResult<(ConnectionInfo, HandshakeResult)> {
    let addr = meta
        .primary_addr()
        .cloned()
        .ok_or_else(|| NetworkError::ConnectionFailed(format!("no address for {}", meta.id.short())))?;
    let (stream, conn) = transport::dial(&addr, key, meta.id).await?;
    let result = handshaker.outbound(stream, meta.id).await?;
    Ok((conn, result))
}
