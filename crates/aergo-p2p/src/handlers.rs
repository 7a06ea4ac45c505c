//! Subprotocol handlers installed on every peer session.
//!
//! Handlers run on the session's reader task, so they must not block.
//! Work that has to wait for the write queue or an external service is
//! spawned onto its own task.

use crate::actor::{ActorService, ChainAccessor, RaftAccessor};
use crate::broadcast;
use crate::cert::{check_and_get_v1, CertificateManager};
use crate::codec::{Message, MsgId};
use crate::manager::PeerManagerHandle;
use crate::message::*;
use crate::order::MsgOrderFactory;
use crate::peer::RemotePeer;
use crate::role::RoleManager;
use crate::sync::SyncManager;
use crate::types::{Block, BlockHeader, BlockId, PeerMeta, PeerRole, ResultStatus};
use crate::wire::{field_size, Payload};
use crate::{
    NetworkError, NetworkResult, EMPTY_GET_BLOCK_RESPONSE_SIZE, MAX_BLOCK_HEADER_RESPONSE_COUNT,
    MAX_BLOCK_RESPONSE_COUNT, MAX_PAYLOAD_LENGTH,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handler of one subprotocol.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()>;
}

/// Subprotocol to handler table shared by the sessions.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<SubProtocol, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, protocol: SubProtocol, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(protocol, handler);
    }

    pub fn get(&self, protocol: SubProtocol) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(&protocol)
    }

    /// Table with every handler this node serves.
    pub fn standard(ctx: Arc<HandlerContext>) -> Self {
        let table: [(SubProtocol, HandlerFn); 26] = [
            (SubProtocol::PING_REQUEST, ping_request),
            (SubProtocol::PING_RESPONSE, ping_response),
            (SubProtocol::GO_AWAY, go_away),
            (SubProtocol::ADDRESSES_REQUEST, addresses_request),
            (SubProtocol::ADDRESSES_RESPONSE, addresses_response),
            (SubProtocol::GET_BLOCKS_REQUEST, get_blocks_request),
            (SubProtocol::GET_BLOCKS_RESPONSE, get_blocks_response),
            (SubProtocol::GET_BLOCK_HEADERS_REQUEST, get_block_headers_request),
            (SubProtocol::GET_BLOCK_HEADERS_RESPONSE, consume_response),
            (SubProtocol::GET_MISSING_REQUEST, get_missing_request),
            (SubProtocol::GET_MISSING_RESPONSE, consume_response),
            (SubProtocol::GET_ANCESTOR_REQUEST, get_ancestor_request),
            (SubProtocol::GET_ANCESTOR_RESPONSE, consume_response),
            (SubProtocol::GET_HASHES_REQUEST, get_hashes_request),
            (SubProtocol::GET_HASHES_RESPONSE, consume_response),
            (SubProtocol::GET_HASH_BY_NO_REQUEST, get_hash_by_no_request),
            (SubProtocol::GET_HASH_BY_NO_RESPONSE, consume_response),
            (SubProtocol::NEW_BLOCK_NOTICE, new_block_notice),
            (SubProtocol::GET_TXS_REQUEST, get_txs_request),
            (SubProtocol::GET_TXS_RESPONSE, consume_response),
            (SubProtocol::NEW_TX_NOTICE, new_tx_notice),
            (SubProtocol::BLOCK_PRODUCED_NOTICE, block_produced_notice),
            (SubProtocol::RAFT_WRAPPER, raft_wrapper),
            (SubProtocol::ISSUE_CERT_REQUEST, issue_cert_request),
            (SubProtocol::ISSUE_CERT_RESPONSE, issue_cert_response),
            (SubProtocol::CERT_RENEWED_NOTICE, cert_renewed_notice),
        ];
        let mut registry = Self::new();
        for (protocol, f) in table {
            registry.insert(
                protocol,
                Arc::new(CtxHandler {
                    ctx: ctx.clone(),
                    f,
                }),
            );
        }
        registry
    }
}

/// Node services the handlers act upon.
pub struct HandlerContext {
    pub self_meta: PeerMeta,
    pub factory: MsgOrderFactory,
    pub chain: Arc<dyn ChainAccessor>,
    pub actor: Arc<dyn ActorService>,
    pub sync: Arc<SyncManager>,
    pub certs: Arc<dyn CertificateManager>,
    pub role: Arc<dyn RoleManager>,
    pub peers: PeerManagerHandle,
    pub raft: Option<Arc<dyn RaftAccessor>>,
}

type HandlerFn = fn(&HandlerContext, &Arc<RemotePeer>, &Message) -> NetworkResult<()>;

struct CtxHandler {
    ctx: Arc<HandlerContext>,
    f: HandlerFn,
}

impl MessageHandler for CtxHandler {
    fn handle(&self, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
        (self.f)(&self.ctx, peer, msg)
    }
}

fn reply<P: Payload>(peer: &RemotePeer, msg: &Message, protocol: SubProtocol, body: &P) {
    if let Some(order) = peer.factory().new_response(msg.id, protocol, body) {
        peer.send_message(order);
    }
}

fn ping_request(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let ping = Ping::decode(&msg.payload)?;
    peer.record_notice(SubProtocol::PING_REQUEST);
    peer.update_last_status(ping.best_block_hash, ping.best_height);
    let best = ctx.chain.best_block()?;
    let pong = Ping {
        best_block_hash: best.hash,
        best_height: best.block_no(),
    };
    reply(peer, msg, SubProtocol::PING_RESPONSE, &pong);
    Ok(())
}

fn ping_response(_ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let pong = Ping::decode(&msg.payload)?;
    peer.update_last_status(pong.best_block_hash, pong.best_height);
    Ok(())
}

fn go_away(_ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let notice = GoAwayNotice::decode(&msg.payload)?;
    info!(peer = %peer.id().short(), reason = %notice.message, "Peer asked to go away");
    Err(NetworkError::GoAway(notice.message))
}

fn addresses_request(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let req = AddressesRequest::decode(&msg.payload)?;
    let peers: Vec<_> = ctx
        .peers
        .get_peers()
        .into_iter()
        .filter(|p| p.id() != peer.id() && p.id() != req.sender.peer_id)
        .filter(|p| !p.remote_info().hidden)
        .take(req.max_size as usize)
        .map(|p| p.meta().to_peer_address())
        .collect();
    debug!(peer = %peer.id().short(), count = peers.len(), "Sending addresses");
    let resp = AddressesResponse {
        status: ResultStatus::Ok,
        peers,
    };
    reply(peer, msg, SubProtocol::ADDRESSES_RESPONSE, &resp);
    Ok(())
}

fn addresses_response(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let resp = AddressesResponse::decode(&msg.payload)?;
    if resp.status != ResultStatus::Ok {
        debug!(peer = %peer.id().short(), status = ?resp.status, "Address query failed");
        return Ok(());
    }
    let metas: Vec<PeerMeta> = resp
        .peers
        .iter()
        .filter(|a| a.peer_id != ctx.self_meta.id)
        .filter(|a| a.addresses.iter().any(|addr| addr.is_dialable()))
        .map(PeerMeta::from_peer_address)
        .collect();
    debug!(peer = %peer.id().short(), received = resp.peers.len(), usable = metas.len(), "Received addresses");
    if !metas.is_empty() {
        ctx.peers.add_discovered(metas);
    }
    Ok(())
}

fn get_blocks_request(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let req = GetBlockRequest::decode(&msg.payload)?;
    let chain = ctx.chain.clone();
    let peer = peer.clone();
    let msg_id = msg.id;
    tokio::spawn(async move {
        if let Err(e) = serve_blocks(chain.as_ref(), &peer, msg_id, req.hashes).await {
            debug!(peer = %peer.id().short(), error = %e, "Failed to send blocks");
        }
    });
    Ok(())
}

/// Stream the requested blocks in payload-bounded chunks.
async fn serve_blocks(
    chain: &dyn ChainAccessor,
    peer: &RemotePeer,
    msg_id: MsgId,
    hashes: Vec<BlockId>,
) -> NetworkResult<()> {
    let mut status = ResultStatus::Ok;
    let mut size = EMPTY_GET_BLOCK_RESPONSE_SIZE;
    let mut blocks: Vec<Block> = Vec::new();
    for hash in hashes.iter().take(MAX_BLOCK_RESPONSE_COUNT) {
        let block = match chain.get_block(hash) {
            Ok(Some(block)) => block,
            Ok(None) => {
                status = ResultStatus::NotFound;
                break;
            }
            Err(e) => {
                warn!(block = %hash, error = %e, "Failed to read requested block");
                status = ResultStatus::Internal;
                break;
            }
        };
        let item = field_size(block.encoded_len());
        if size + item > MAX_PAYLOAD_LENGTH && !blocks.is_empty() {
            let chunk = GetBlockResponse {
                status: ResultStatus::Ok,
                blocks: std::mem::take(&mut blocks),
                has_next: true,
            };
            send_response(peer, msg_id, SubProtocol::GET_BLOCKS_RESPONSE, &chunk).await?;
            size = EMPTY_GET_BLOCK_RESPONSE_SIZE;
        }
        size += item;
        blocks.push(block);
    }
    let last = GetBlockResponse {
        status,
        blocks,
        has_next: false,
    };
    send_response(peer, msg_id, SubProtocol::GET_BLOCKS_RESPONSE, &last).await
}

async fn send_response<P: Payload>(
    peer: &RemotePeer,
    msg_id: MsgId,
    protocol: SubProtocol,
    body: &P,
) -> NetworkResult<()> {
    let order = peer
        .factory()
        .new_response(msg_id, protocol, body)
        .ok_or_else(|| NetworkError::Serialization(protocol.to_string()))?;
    peer.send_and_wait(order).await
}

fn get_blocks_response(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let resp = GetBlockResponse::decode(&msg.payload)?;
    ctx.sync
        .handle_get_block_response(peer.id(), msg.original_id, resp);
    Ok(())
}

/// Responses whose request carried no receiver.
fn consume_response(_ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    debug!(
        peer = %peer.id().short(),
        protocol = %msg.subprotocol,
        orig_id = %msg.original_id,
        "Response without receiver, dropped"
    );
    Ok(())
}

/// Headers walking back from a hash, or down from a height.
fn collect_headers(
    chain: &dyn ChainAccessor,
    req: &GetBlockHeadersRequest,
) -> NetworkResult<(Vec<BlockId>, Vec<BlockHeader>)> {
    let max = (req.size as usize).min(MAX_BLOCK_HEADER_RESPONSE_COUNT);
    let mut hashes = Vec::new();
    let mut headers = Vec::new();
    match req.hash {
        Some(start) => {
            let mut hash = start;
            while hashes.len() < max {
                let Some(block) = chain.get_block(&hash)? else { break };
                hashes.push(block.hash);
                let prev = block.header.prev_block_hash;
                let at_genesis = block.block_no() == 0;
                headers.push(block.header);
                if at_genesis {
                    break;
                }
                hash = prev;
            }
        }
        None => {
            let mut no = req.height;
            while hashes.len() < max {
                let Some(hash) = chain.get_hash_by_no(no)? else { break };
                let Some(block) = chain.get_block(&hash)? else { break };
                hashes.push(block.hash);
                headers.push(block.header);
                if no == 0 {
                    break;
                }
                no -= 1;
            }
        }
    }
    Ok((hashes, headers))
}

fn get_block_headers_request(
    ctx: &HandlerContext,
    peer: &Arc<RemotePeer>,
    msg: &Message,
) -> NetworkResult<()> {
    let req = GetBlockHeadersRequest::decode(&msg.payload)?;
    let resp = match collect_headers(ctx.chain.as_ref(), &req) {
        Ok((hashes, headers)) => HeadersResponse {
            status: ResultStatus::Ok,
            hashes,
            headers,
            has_next: false,
        },
        Err(e) => {
            warn!(error = %e, "Failed to collect headers");
            HeadersResponse {
                status: ResultStatus::Internal,
                ..Default::default()
            }
        }
    };
    reply(peer, msg, SubProtocol::GET_BLOCK_HEADERS_RESPONSE, &resp);
    Ok(())
}

/// Whether `hash` is the main chain block at its height.
fn main_chain_no(chain: &dyn ChainAccessor, hash: &BlockId) -> NetworkResult<Option<u64>> {
    let Some(block) = chain.get_block(hash)? else {
        return Ok(None);
    };
    let no = block.block_no();
    Ok((chain.get_hash_by_no(no)? == Some(*hash)).then_some(no))
}

fn first_main_chain(
    chain: &dyn ChainAccessor,
    hashes: &[BlockId],
) -> NetworkResult<Option<(BlockId, u64)>> {
    for hash in hashes {
        if let Some(no) = main_chain_no(chain, hash)? {
            return Ok(Some((*hash, no)));
        }
    }
    Ok(None)
}

/// Blocks after the first known anchor up to the stop hash.
fn collect_missing(chain: &dyn ChainAccessor, req: &GetMissingRequest) -> NetworkResult<HeadersResponse> {
    let Some((_, anchor_no)) = first_main_chain(chain, &req.hashes)? else {
        return Ok(HeadersResponse {
            status: ResultStatus::NotFound,
            ..Default::default()
        });
    };
    let stop_no = match main_chain_no(chain, &req.stop_hash)? {
        Some(no) => no,
        None => chain.best_block()?.block_no(),
    };
    let mut resp = HeadersResponse {
        status: ResultStatus::Ok,
        ..Default::default()
    };
    let mut no = anchor_no + 1;
    while no <= stop_no && resp.hashes.len() < MAX_BLOCK_HEADER_RESPONSE_COUNT {
        let Some(hash) = chain.get_hash_by_no(no)? else { break };
        let Some(block) = chain.get_block(&hash)? else { break };
        resp.hashes.push(hash);
        resp.headers.push(block.header);
        no += 1;
    }
    Ok(resp)
}

fn get_missing_request(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let req = GetMissingRequest::decode(&msg.payload)?;
    let resp = collect_missing(ctx.chain.as_ref(), &req).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to collect missing blocks");
        HeadersResponse {
            status: ResultStatus::Internal,
            ..Default::default()
        }
    });
    reply(peer, msg, SubProtocol::GET_MISSING_RESPONSE, &resp);
    Ok(())
}

fn get_ancestor_request(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let req = GetAncestorRequest::decode(&msg.payload)?;
    let resp = match first_main_chain(ctx.chain.as_ref(), &req.hashes) {
        Ok(Some((hash, no))) => GetAncestorResponse {
            status: ResultStatus::Ok,
            ancestor_hash: Some(hash),
            ancestor_no: no,
        },
        Ok(None) => GetAncestorResponse {
            status: ResultStatus::NotFound,
            ..Default::default()
        },
        Err(e) => {
            warn!(error = %e, "Failed to find ancestor");
            GetAncestorResponse {
                status: ResultStatus::Internal,
                ..Default::default()
            }
        }
    };
    reply(peer, msg, SubProtocol::GET_ANCESTOR_RESPONSE, &resp);
    Ok(())
}

fn collect_hashes(chain: &dyn ChainAccessor, req: &GetHashesRequest) -> NetworkResult<GetHashesResponse> {
    if chain.get_hash_by_no(req.prev_number)? != Some(req.prev_hash) {
        return Ok(GetHashesResponse {
            status: ResultStatus::InvalidArgument,
            ..Default::default()
        });
    }
    let max = (req.size as usize).min(MAX_BLOCK_HEADER_RESPONSE_COUNT);
    let mut hashes = Vec::new();
    let mut no = req.prev_number + 1;
    while hashes.len() < max {
        let Some(hash) = chain.get_hash_by_no(no)? else { break };
        hashes.push(hash);
        no += 1;
    }
    Ok(GetHashesResponse {
        status: ResultStatus::Ok,
        hashes,
        has_next: false,
    })
}

fn get_hashes_request(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let req = GetHashesRequest::decode(&msg.payload)?;
    let resp = collect_hashes(ctx.chain.as_ref(), &req).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to collect hashes");
        GetHashesResponse {
            status: ResultStatus::Internal,
            ..Default::default()
        }
    });
    reply(peer, msg, SubProtocol::GET_HASHES_RESPONSE, &resp);
    Ok(())
}

fn get_hash_by_no_request(
    ctx: &HandlerContext,
    peer: &Arc<RemotePeer>,
    msg: &Message,
) -> NetworkResult<()> {
    let req = GetHashByNo::decode(&msg.payload)?;
    let resp = match ctx.chain.get_hash_by_no(req.block_no) {
        Ok(Some(hash)) => GetHashByNoResponse {
            status: ResultStatus::Ok,
            block_hash: Some(hash),
        },
        Ok(None) => GetHashByNoResponse {
            status: ResultStatus::NotFound,
            block_hash: None,
        },
        Err(e) => {
            warn!(error = %e, "Failed to look up hash by number");
            GetHashByNoResponse {
                status: ResultStatus::Internal,
                block_hash: None,
            }
        }
    };
    reply(peer, msg, SubProtocol::GET_HASH_BY_NO_RESPONSE, &resp);
    Ok(())
}

fn new_block_notice(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let notice = NewBlockNotice::decode(&msg.payload)?;
    peer.record_notice(SubProtocol::NEW_BLOCK_NOTICE);
    peer.mark_block_known(notice.block_hash);
    peer.update_last_status(notice.block_hash, notice.block_no);
    ctx.sync
        .handle_new_block_notice(peer.id(), notice.block_hash, notice.block_no);
    Ok(())
}

fn get_txs_request(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let req = GetTransactionsRequest::decode(&msg.payload)?;
    match ctx.sync.handle_get_tx_req(peer.clone(), msg.id, req.hashes) {
        Ok(()) => Ok(()),
        Err(NetworkError::ResourceExhausted) => {
            debug!(peer = %peer.id().short(), "Too many tx pulls in progress");
            let resp = GetTransactionsResponse {
                status: ResultStatus::ResourceExhausted,
                ..Default::default()
            };
            reply(peer, msg, SubProtocol::GET_TXS_RESPONSE, &resp);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn new_tx_notice(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let notice = NewTransactionsNotice::decode(&msg.payload)?;
    peer.record_notice(SubProtocol::NEW_TX_NOTICE);
    peer.mark_txs_known(&notice.tx_hashes);
    ctx.sync.handle_new_tx_notice(peer.id(), notice.tx_hashes);
    Ok(())
}

fn block_produced_notice(
    ctx: &HandlerContext,
    peer: &Arc<RemotePeer>,
    msg: &Message,
) -> NetworkResult<()> {
    let notice = BlockProducedNotice::decode(&msg.payload)?;
    let block = notice.block;
    peer.record_notice(SubProtocol::BLOCK_PRODUCED_NOTICE);
    peer.mark_block_known(block.hash);
    peer.update_last_status(block.hash, block.block_no());
    if !ctx.sync.handle_block_produced_notice(peer.id(), block.clone()) {
        return Ok(());
    }
    // agents relay blocks of the producers they front
    if ctx.role.self_role() == PeerRole::Agent
        && ctx.certs.get_producers().contains(&notice.producer_id)
    {
        let result = broadcast::relay_bp_notice(
            &ctx.factory,
            ctx.role.as_ref(),
            ctx.peers.get_peers(),
            peer.id(),
            &block,
            msg.clone(),
        );
        debug!(block = %block.hash, sent = result.sent, "Relayed produced block");
    }
    Ok(())
}

fn raft_wrapper(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let wrapped = RaftWrapperMessage::decode(&msg.payload)?;
    match &ctx.raft {
        Some(raft) => raft.receive(peer.id(), wrapped),
        None => debug!(peer = %peer.id().short(), "Raft is not running, message dropped"),
    }
    Ok(())
}

fn issue_cert_request(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let resp = match ctx.certs.create_certificate(&peer.meta()) {
        Ok(cert) => IssueCertificateResponse {
            status: ResultStatus::Ok,
            certificate: Some(cert.to_raw()),
        },
        Err(NetworkError::InvalidRole) => IssueCertificateResponse {
            status: ResultStatus::PermissionDenied,
            certificate: None,
        },
        Err(e) => {
            warn!(peer = %peer.id().short(), error = %e, "Failed to issue certificate");
            IssueCertificateResponse {
                status: ResultStatus::Unavailable,
                certificate: None,
            }
        }
    };
    reply(peer, msg, SubProtocol::ISSUE_CERT_RESPONSE, &resp);
    Ok(())
}

fn issue_cert_response(ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    let resp = IssueCertificateResponse::decode(&msg.payload)?;
    match (resp.status, resp.certificate) {
        (ResultStatus::Ok, Some(raw)) => {
            let cert = check_and_get_v1(&raw)?;
            ctx.certs.add_certificate(cert);
        }
        (status, _) => {
            info!(peer = %peer.id().short(), ?status, "Producer refused to issue certificate");
        }
    }
    Ok(())
}

fn cert_renewed_notice(_ctx: &HandlerContext, peer: &Arc<RemotePeer>, msg: &Message) -> NetworkResult<()> {
    if peer.accepted_role() != PeerRole::Agent {
        debug!(peer = %peer.id().short(), "Certificate notice from non-agent, dropped");
        return Ok(());
    }
    let notice = CertificateRenewedNotice::decode(&msg.payload)?;
    let cert = check_and_get_v1(&notice.certificate)?;
    if cert.agent_id != peer.id() {
        return Err(NetworkError::InvalidCertificate(
            "certificate issued to another agent".into(),
        ));
    }
    debug!(peer = %peer.id().short(), bp = %cert.bp_id.short(), "Agent certificate renewed");
    peer.add_certificate(cert);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{new_certificate_manager, AgentCertificate, CERT_TTL};
    use crate::codec::{framed, MsgFramed};
    use crate::key::NodeKey;
    use crate::peer::LastStatus;
    use crate::role::RaftRoleManager;
    use crate::service::P2PCommand;
    use crate::testutil::{meta_with_role, remote_info_of, test_env, TestActor, TestChain};
    use crate::types::{Hash32, PeerId};
    use futures::{SinkExt, StreamExt};
    use tokio::sync::mpsc;

    struct Fixture {
        chain: Arc<TestChain>,
        actor: Arc<TestActor>,
        peer: Arc<RemotePeer>,
        remote: MsgFramed,
        commands: mpsc::Receiver<P2PCommand>,
        events: mpsc::Receiver<crate::manager::ManagerEvent>,
    }

    fn fixture_with(role: PeerRole) -> Fixture {
        let test = test_env();
        let actor = Arc::new(TestActor::default());
        let (cmd_tx, commands) = mpsc::channel(16);
        let (peers, events) = PeerManagerHandle::detached();
        let self_key = NodeKey::generate();
        let self_meta = meta_with_role(self_key.id(), role);
        let (sync, _task) = SyncManager::new(
            test.chain.clone(),
            actor.clone(),
            peers.clone(),
            MsgOrderFactory::new(),
            cmd_tx.clone(),
        );
        let ctx = Arc::new(HandlerContext {
            self_meta: self_meta.clone(),
            factory: MsgOrderFactory::new(),
            chain: test.chain.clone(),
            actor: actor.clone(),
            sync: Arc::new(sync),
            certs: new_certificate_manager(self_meta, *self_key.secret(), cmd_tx),
            role: Arc::new(RaftRoleManager::new(role)),
            peers,
            raft: None,
        });
        let (local, remote) = tokio::io::duplex(1 << 20);
        let info = remote_info_of(meta_with_role(NodeKey::generate().id(), PeerRole::Agent));
        let peer = RemotePeer::new(
            info,
            LastStatus {
                block_hash: Hash32::default(),
                block_no: 0,
            },
            test.env,
        );
        peer.start(framed(Box::new(local)), HandlerRegistry::standard(ctx));
        Fixture {
            chain: test.chain,
            actor,
            peer,
            remote: framed(Box::new(remote)),
            commands,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PeerRole::Watcher)
    }

    async fn request<P: Payload>(f: &mut Fixture, protocol: SubProtocol, body: &P) -> Message {
        let req = Message::new(protocol, body.encode().unwrap());
        let id = req.id;
        f.remote.send(req).await.unwrap();
        let resp = f.remote.next().await.unwrap().unwrap();
        assert_eq!(resp.original_id, id);
        resp
    }

    #[tokio::test]
    async fn test_ping_updates_status_and_replies() {
        let mut f = fixture();
        let ping = Ping {
            best_block_hash: Hash32::digest(b"remote-best"),
            best_height: 42,
        };
        let resp = request(&mut f, SubProtocol::PING_REQUEST, &ping).await;
        assert_eq!(resp.subprotocol, SubProtocol::PING_RESPONSE);
        let pong = Ping::decode(&resp.payload).unwrap();
        assert_eq!(pong.best_height, 3);
        assert_eq!(f.peer.last_status().block_no, 42);
        assert!(f.peer.last_notice(SubProtocol::PING_REQUEST).is_some());
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_get_blocks_reports_not_found() {
        let mut f = fixture();
        let req = GetBlockRequest {
            hashes: vec![f.chain.block(1).hash, Hash32::digest(b"missing"), f.chain.block(2).hash],
        };
        let resp = request(&mut f, SubProtocol::GET_BLOCKS_REQUEST, &req).await;
        let body = GetBlockResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.status, ResultStatus::NotFound);
        assert_eq!(body.blocks.len(), 1);
        assert!(!body.has_next);
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_headers_walk_back_from_hash() {
        let mut f = fixture();
        let req = GetBlockHeadersRequest {
            hash: Some(f.chain.block(3).hash),
            size: 10,
            ..Default::default()
        };
        let resp = request(&mut f, SubProtocol::GET_BLOCK_HEADERS_REQUEST, &req).await;
        let body = HeadersResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.hashes.len(), 4);
        assert_eq!(body.hashes[0], f.chain.block(3).hash);
        assert_eq!(body.headers[3].block_no, 0);
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_missing_and_ancestor() {
        let mut f = fixture();
        let foreign = Hash32::digest(b"fork");
        let req = GetMissingRequest {
            hashes: vec![foreign, f.chain.block(1).hash],
            stop_hash: f.chain.block(3).hash,
        };
        let resp = request(&mut f, SubProtocol::GET_MISSING_REQUEST, &req).await;
        let body = HeadersResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.hashes, vec![f.chain.block(2).hash, f.chain.block(3).hash]);

        let req = GetAncestorRequest {
            hashes: vec![foreign, f.chain.block(2).hash],
        };
        let resp = request(&mut f, SubProtocol::GET_ANCESTOR_REQUEST, &req).await;
        let body = GetAncestorResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.ancestor_no, 2);

        let req = GetAncestorRequest {
            hashes: vec![foreign],
        };
        let resp = request(&mut f, SubProtocol::GET_ANCESTOR_REQUEST, &req).await;
        let body = GetAncestorResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.status, ResultStatus::NotFound);
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_hashes_require_matching_prev() {
        let mut f = fixture();
        let req = GetHashesRequest {
            prev_hash: f.chain.block(0).hash,
            prev_number: 0,
            size: 100,
        };
        let resp = request(&mut f, SubProtocol::GET_HASHES_REQUEST, &req).await;
        let body = GetHashesResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.status, ResultStatus::Ok);
        assert_eq!(body.hashes.len(), 3);

        let req = GetHashesRequest {
            prev_hash: Hash32::digest(b"other"),
            prev_number: 0,
            size: 100,
        };
        let resp = request(&mut f, SubProtocol::GET_HASHES_REQUEST, &req).await;
        let body = GetHashesResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.status, ResultStatus::InvalidArgument);

        let resp = request(&mut f, SubProtocol::GET_HASH_BY_NO_REQUEST, &GetHashByNo { block_no: 9 }).await;
        let body = GetHashByNoResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.status, ResultStatus::NotFound);
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_block_notice_triggers_fetch() {
        let mut f = fixture();
        let hash = Hash32::digest(b"new-block");
        let notice = NewBlockNotice {
            block_hash: hash,
            block_no: 10,
        };
        f.remote
            .send(Message::new(SubProtocol::NEW_BLOCK_NOTICE, notice.encode().unwrap()))
            .await
            .unwrap();
        match f.commands.recv().await {
            Some(P2PCommand::GetBlockInfos { to, hashes }) => {
                assert_eq!(to, f.peer.id());
                assert_eq!(hashes, vec![hash]);
            }
            _ => panic!("expected a block fetch"),
        }
        assert!(f.peer.knows_block(&hash));
        assert_eq!(f.peer.last_status().block_no, 10);
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_addresses_response_feeds_manager() {
        let mut f = fixture();
        let good = meta_with_role(NodeKey::generate().id(), PeerRole::Watcher);
        let mut unusable = meta_with_role(NodeKey::generate().id(), PeerRole::Watcher);
        unusable.addresses.clear();
        let resp = AddressesResponse {
            status: ResultStatus::Ok,
            peers: vec![good.to_peer_address(), unusable.to_peer_address()],
        };
        f.remote
            .send(Message::new_response(
                SubProtocol::ADDRESSES_RESPONSE,
                MsgId::new(),
                resp.encode().unwrap(),
            ))
            .await
            .unwrap();
        match f.events.recv().await {
            Some(crate::manager::ManagerEvent::Discovered(metas)) => {
                assert_eq!(metas.len(), 1);
                assert_eq!(metas[0].id, good.id);
            }
            _ => panic!("expected discovered peers"),
        }
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_watcher_cannot_issue_certificate() {
        let mut f = fixture();
        let resp = request(&mut f, SubProtocol::ISSUE_CERT_REQUEST, &IssueCertificateRequest).await;
        let body = IssueCertificateResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.status, ResultStatus::PermissionDenied);
        assert!(body.certificate.is_none());
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_producer_issues_certificate() {
        let mut f = fixture_with(PeerRole::Producer);
        let resp = request(&mut f, SubProtocol::ISSUE_CERT_REQUEST, &IssueCertificateRequest).await;
        let body = IssueCertificateResponse::decode(&resp.payload).unwrap();
        assert_eq!(body.status, ResultStatus::Ok);
        let cert = check_and_get_v1(&body.certificate.unwrap()).unwrap();
        assert_eq!(cert.agent_id, f.peer.id());
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_cert_renewed_from_agent() {
        let mut f = fixture();
        let bp = NodeKey::generate();
        let cert = AgentCertificate::new_v1(bp.secret(), f.peer.id(), vec!["10.0.0.2".into()], CERT_TTL)
            .unwrap();
        let notice = CertificateRenewedNotice {
            certificate: cert.to_raw(),
        };
        f.remote
            .send(Message::new(SubProtocol::CERT_RENEWED_NOTICE, notice.encode().unwrap()))
            .await
            .unwrap();
        // a ping round trip orders the notice before the assertion
        let ping = Ping::default();
        request(&mut f, SubProtocol::PING_REQUEST, &ping).await;
        let certs = f.peer.certificates();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].bp_id, bp.id());

        let stranger = AgentCertificate::new_v1(
            bp.secret(),
            PeerId::from_bytes([3; 32]),
            vec!["10.0.0.3".into()],
            CERT_TTL,
        )
        .unwrap();
        let notice = CertificateRenewedNotice {
            certificate: stranger.to_raw(),
        };
        f.remote
            .send(Message::new(SubProtocol::CERT_RENEWED_NOTICE, notice.encode().unwrap()))
            .await
            .unwrap();
        request(&mut f, SubProtocol::PING_REQUEST, &ping).await;
        assert_eq!(f.peer.certificates()[0].agent_id, f.peer.id());
        assert!(f.actor.added_blocks.lock().is_empty());
        f.peer.stop();
    }

    #[tokio::test]
    async fn test_go_away_stops_session() {
        let mut f = fixture();
        let notice = GoAwayNotice {
            message: "bye".into(),
        };
        f.remote
            .send(Message::new(SubProtocol::GO_AWAY, notice.encode().unwrap()))
            .await
            .unwrap();
        assert!(f.remote.next().await.is_none());
        assert!(!f.peer.is_running());
    }
}
