//! Remote peer session.
//!
//! A session owns three tasks once started: a reader dispatching incoming
//! messages, a writer draining the bounded order queue, and a maintenance
//! task for pings, queued tx notices and the request table. Whatever ends
//! the session, the writer runs the teardown exactly once and reports the
//! peer to the manager.

use crate::actor::{ChainAccessor, RaftAccessor};
use crate::cert::AgentCertificate;
use crate::codec::{Message, MsgFramed, MsgId, MsgSink, MsgStream};
use crate::handlers::HandlerRegistry;
use crate::handshake::P2PVersion;
use crate::message::{Ping, SubProtocol};
use crate::order::{MsgOrder, MsgOrderFactory, ResponseReceiver, MAX_TX_NOTICE_HASHES};
use crate::tracer::{NoticeReport, TxNoticeTracer};
use crate::types::{BlockId, ConnectionInfo, PeerId, PeerMeta, PeerRole, PeerZone, TxId};
use crate::{NetworkError, NetworkResult};
use futures::{SinkExt, StreamExt};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the write queue.
pub const WRITE_QUEUE_SIZE: usize = 40;

/// Block hashes remembered as known by the remote.
pub const BLK_HASH_CACHE_SIZE: usize = 100;

/// Tx hashes remembered as known by the remote.
pub const TX_HASH_CACHE_SIZE: usize = 2000;

/// Tx hashes waiting for the next notice flush.
pub const TX_QUEUE_SIZE: usize = 2000;

pub const PING_INTERVAL: Duration = Duration::from_secs(60);
pub const TX_NOTICE_INTERVAL: Duration = Duration::from_secs(3);
pub const REQUEST_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Age after which an unanswered request is dropped by the sweep.
pub const SYNC_WORK_TTL: Duration = Duration::from_secs(30);

pub const GAP_TO_SKIP_ALL: i64 = 86400;
pub const GAP_TO_SKIP_HOURLY: i64 = 3600;
pub const GAP_TO_SKIP_5MIN: i64 = 300;
pub const MIN_NEW_BLK_NOTICE_INTERVAL: Duration = Duration::from_millis(250);

/// Consecutive dropped enqueues after which the peer counts as hung.
pub const MAX_DROP_COUNT: u32 = 20;

/// A single write blocked for this long marks the peer as hung.
pub const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(60);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::Starting,
            1 => PeerState::Running,
            2 => PeerState::Stopping,
            _ => PeerState::Stopped,
        }
    }
}

/// Handshake-time description of the remote plus the arbitration results.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub meta: PeerMeta,
    pub connection: ConnectionInfo,
    pub zone: PeerZone,
    pub accepted_role: PeerRole,
    pub certificates: Vec<AgentCertificate>,
    pub hidden: bool,
    pub version: P2PVersion,
}

/// Services shared by every session.
pub struct SessionEnv {
    pub factory: MsgOrderFactory,
    pub chain: Arc<dyn ChainAccessor>,
    pub tracer: TxNoticeTracer,
    pub raft: Option<Arc<dyn RaftAccessor>>,
    /// Receives every session once its teardown is complete.
    pub removed: mpsc::UnboundedSender<Arc<RemotePeer>>,
}

/// Best block last reported by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastStatus {
    pub block_hash: BlockId,
    pub block_no: u64,
}

struct RequestInfo {
    sent_at: Instant,
    protocol: SubProtocol,
    receiver: Option<Box<dyn ResponseReceiver>>,
}

#[derive(Default)]
struct NoticeState {
    last_blk_notice: Option<Instant>,
    skip_cnt: i64,
}

pub struct RemotePeer {
    id: PeerId,
    info: RwLock<RemoteInfo>,
    state: AtomicU8,
    write_tx: mpsc::Sender<MsgOrder>,
    write_rx: Mutex<Option<mpsc::Receiver<MsgOrder>>>,
    requests: Mutex<HashMap<MsgId, RequestInfo>>,
    blk_cache: Mutex<LruCache<BlockId, ()>>,
    tx_cache: Mutex<LruCache<TxId, ()>>,
    last_status: Mutex<LastStatus>,
    notice: Mutex<NoticeState>,
    last_notice: Mutex<HashMap<SubProtocol, Instant>>,
    tx_queue: Mutex<VecDeque<TxId>>,
    drop_count: AtomicU32,
    writing_since: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    env: Arc<SessionEnv>,
}

fn lru<K: std::hash::Hash + Eq>(size: usize) -> Mutex<LruCache<K, ()>> {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN),
    ))
}

impl RemotePeer {
    /// New session in `Starting`. `status` primes the remote's best block.
    pub fn new(info: RemoteInfo, status: LastStatus, env: Arc<SessionEnv>) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        Arc::new(Self {
            id: info.meta.id,
            info: RwLock::new(info),
            state: AtomicU8::new(PeerState::Starting as u8),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            requests: Mutex::new(HashMap::new()),
            blk_cache: lru(BLK_HASH_CACHE_SIZE),
            tx_cache: lru(TX_HASH_CACHE_SIZE),
            last_status: Mutex::new(status),
            notice: Mutex::new(NoticeState::default()),
            last_notice: Mutex::new(HashMap::new()),
            tx_queue: Mutex::new(VecDeque::with_capacity(TX_QUEUE_SIZE)),
            drop_count: AtomicU32::new(0),
            writing_since: Mutex::new(None),
            cancel: CancellationToken::new(),
            env,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn env(&self) -> &SessionEnv {
        &self.env
    }

    pub fn factory(&self) -> &MsgOrderFactory {
        &self.env.factory
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == PeerState::Running
    }

    pub fn remote_info(&self) -> RemoteInfo {
        self.info.read().clone()
    }

    pub fn meta(&self) -> PeerMeta {
        self.info.read().meta.clone()
    }

    pub fn accepted_role(&self) -> PeerRole {
        self.info.read().accepted_role
    }

    pub fn set_accepted_role(&self, role: PeerRole) {
        self.info.write().accepted_role = role;
    }

    pub fn zone(&self) -> PeerZone {
        self.info.read().zone
    }

    pub fn is_outbound(&self) -> bool {
        self.info.read().connection.outbound
    }

    pub fn certificates(&self) -> Vec<AgentCertificate> {
        self.info.read().certificates.clone()
    }

    /// Store a certificate presented by the remote, replacing the one of the same producer.
    pub fn add_certificate(&self, cert: AgentCertificate) {
        let mut info = self.info.write();
        info.certificates.retain(|c| c.bp_id != cert.bp_id);
        info.certificates.push(cert);
    }

    pub fn last_status(&self) -> LastStatus {
        *self.last_status.lock()
    }

    pub fn update_last_status(&self, block_hash: BlockId, block_no: u64) {
        *self.last_status.lock() = LastStatus {
            block_hash,
            block_no,
        };
    }

    pub fn record_notice(&self, protocol: SubProtocol) {
        self.last_notice.lock().insert(protocol, Instant::now());
    }

    pub fn last_notice(&self, protocol: SubProtocol) -> Option<Instant> {
        self.last_notice.lock().get(&protocol).copied()
    }

    pub fn knows_block(&self, hash: &BlockId) -> bool {
        self.blk_cache.lock().contains(hash)
    }

    pub fn mark_block_known(&self, hash: BlockId) {
        self.blk_cache.lock().put(hash, ());
    }

    pub fn knows_tx(&self, hash: &TxId) -> bool {
        self.tx_cache.lock().contains(hash)
    }

    pub fn mark_txs_known(&self, hashes: &[TxId]) {
        let mut cache = self.tx_cache.lock();
        for hash in hashes {
            cache.put(*hash, ());
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Start the session tasks on the handshaken stream.
    pub fn start(self: &Arc<Self>, framed: MsgFramed, handlers: HandlerRegistry) {
        let Some(write_rx) = self.write_rx.lock().take() else {
            warn!(peer = %self.id.short(), "Session already started");
            return;
        };
        if self
            .state
            .compare_exchange(
                PeerState::Starting as u8,
                PeerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!(peer = %self.id.short(), "Session stopped before start");
            self.cancel.cancel();
        }

        let (sink, stream) = framed.split();
        tokio::spawn(self.clone().run_writer(sink, write_rx));
        tokio::spawn(self.clone().run_reader(stream, handlers));
        tokio::spawn(self.clone().run_maintenance());
        info!(
            peer = %self.id.short(),
            outbound = self.is_outbound(),
            role = %self.accepted_role(),
            "Peer session started"
        );
    }

    /// Begin teardown. Idempotent.
    pub fn stop(&self) {
        let moved = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match PeerState::from_u8(s) {
                    PeerState::Starting | PeerState::Running => Some(PeerState::Stopping as u8),
                    _ => None,
                }
            })
            .is_ok();
        if moved {
            debug!(peer = %self.id.short(), "Stopping peer session");
        }
        self.cancel.cancel();
    }

    /// Ask the remote to leave, then stop.
    pub fn go_away(&self, reason: &str) {
        if let Some(order) = self.env.factory.new_go_away(reason) {
            self.send_message(order);
        }
        self.stop();
    }

    /// Queue an order without waiting. A full queue drops the order.
    pub fn send_message(&self, order: MsgOrder) {
        if !self.is_running() {
            order.cancel_send(self);
            return;
        }
        match self.write_tx.try_send(order) {
            Ok(()) => {
                self.drop_count.store(0, Ordering::Relaxed);
            }
            Err(TrySendError::Full(order)) => {
                let drops = self.drop_count.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    peer = %self.id.short(),
                    protocol = %order.protocol(),
                    drops,
                    "Write queue full, message dropped"
                );
                order.cancel_send(self);
                let stalled = self
                    .writing_since
                    .lock()
                    .map_or(false, |t| t.elapsed() > WRITE_STALL_TIMEOUT);
                if drops > MAX_DROP_COUNT || stalled {
                    warn!(peer = %self.id.short(), drops, stalled, "Peer is not draining writes, stopping");
                    self.stop();
                }
            }
            Err(TrySendError::Closed(order)) => order.cancel_send(self),
        }
    }

    /// Queue an order, waiting for room in the queue.
    pub async fn send_and_wait(&self, order: MsgOrder) -> NetworkResult<()> {
        if !self.is_running() {
            order.cancel_send(self);
            return Err(NetworkError::PeerStopped);
        }
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => None,
            permit = self.write_tx.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => {
                permit.send(order);
                Ok(())
            }
            None => {
                order.cancel_send(self);
                Err(NetworkError::PeerStopped)
            }
        }
    }

    /// Queue tx hashes for the next notice to this peer.
    pub fn push_txs_notice(&self, hashes: &[TxId]) {
        if !self.is_running() {
            self.env.tracer.report(NoticeReport::Fail, hashes);
            return;
        }
        let mut full = Vec::new();
        {
            let mut queue = self.tx_queue.lock();
            for hash in hashes {
                if queue.len() >= TX_QUEUE_SIZE {
                    full.push(queue.drain(..).collect::<Vec<_>>());
                }
                queue.push_back(*hash);
            }
        }
        for batch in full {
            self.send_tx_notice_batch(batch);
        }
    }

    fn flush_tx_notices(&self) {
        let batch: Vec<TxId> = self.tx_queue.lock().drain(..).collect();
        if !batch.is_empty() {
            self.send_tx_notice_batch(batch);
        }
    }

    fn send_tx_notice_batch(&self, hashes: Vec<TxId>) {
        let (known, fresh): (Vec<TxId>, Vec<TxId>) = {
            let cache = self.tx_cache.lock();
            hashes.into_iter().partition(|h| cache.contains(h))
        };
        self.env.tracer.report(NoticeReport::Skip, &known);
        for chunk in fresh.chunks(MAX_TX_NOTICE_HASHES) {
            match self.env.factory.new_tx_notice(chunk.to_vec()) {
                Some(order) => self.send_message(order),
                None => self.env.tracer.report(NoticeReport::Fail, chunk),
            }
        }
    }

    pub(crate) fn register_request(
        &self,
        id: MsgId,
        protocol: SubProtocol,
        receiver: Option<Box<dyn ResponseReceiver>>,
    ) {
        self.requests.lock().insert(
            id,
            RequestInfo {
                sent_at: Instant::now(),
                protocol,
                receiver,
            },
        );
    }

    /// Drop the request entry of `id`, if any.
    pub fn consume_request(&self, id: &MsgId) {
        self.requests.lock().remove(id);
    }

    /// Whether a block notice should go out now. Counts skips.
    pub(crate) fn check_block_notice(&self, hash: &BlockId, block_no: u64) -> bool {
        if self.knows_block(hash) {
            return false;
        }
        let remote_no = self.last_status.lock().block_no;
        let diff = remote_no as i64 - block_no as i64;
        let mut notice = self.notice.lock();
        let skip = if diff >= GAP_TO_SKIP_ALL {
            true
        } else if diff >= GAP_TO_SKIP_HOURLY {
            notice.skip_cnt < GAP_TO_SKIP_HOURLY
        } else if diff >= GAP_TO_SKIP_5MIN {
            notice.skip_cnt < GAP_TO_SKIP_5MIN
        } else {
            false
        };
        let too_soon = notice
            .last_blk_notice
            .map_or(false, |t| t.elapsed() < MIN_NEW_BLK_NOTICE_INTERVAL);
        if skip || too_soon {
            notice.skip_cnt += 1;
            return false;
        }
        true
    }

    pub(crate) fn block_notice_sent(&self, hash: BlockId) {
        {
            let mut notice = self.notice.lock();
            notice.last_blk_notice = Some(Instant::now());
            notice.skip_cnt = 0;
        }
        self.mark_block_known(hash);
    }

    /// Expire requests older than `ttl`. Returns the number dropped.
    pub fn sweep_requests(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(MsgId, RequestInfo)> = {
            let mut requests = self.requests.lock();
            let ids: Vec<MsgId> = requests
                .iter()
                .filter(|(_, r)| now.saturating_duration_since(r.sent_at) > ttl)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| requests.remove(&id).map(|r| (id, r)))
                .collect()
        };
        let count = expired.len();
        for (id, info) in expired {
            debug!(peer = %self.id.short(), msg_id = %id, protocol = %info.protocol, "Request expired");
            if let Some(mut receiver) = info.receiver {
                receiver.on_timeout(self);
            }
        }
        count
    }

    /// Route a response to its receiver. Returns `true` when consumed.
    fn consume_response(&self, msg: &Message) -> bool {
        let entry = self.requests.lock().remove(&msg.original_id);
        match entry {
            Some(RequestInfo {
                sent_at,
                protocol,
                receiver: Some(mut receiver),
            }) => {
                if !receiver.receive(msg, self) {
                    self.requests.lock().insert(
                        msg.original_id,
                        RequestInfo {
                            sent_at,
                            protocol,
                            receiver: Some(receiver),
                        },
                    );
                }
                true
            }
            Some(_) => false,
            None => {
                debug!(
                    peer = %self.id.short(),
                    orig_id = %msg.original_id,
                    protocol = %msg.subprotocol,
                    "Response to unknown request"
                );
                false
            }
        }
    }

    fn handle_message(self: &Arc<Self>, msg: Message, handlers: &HandlerRegistry) {
        if msg.is_response() && self.consume_response(&msg) {
            return;
        }
        let Some(handler) = handlers.get(msg.subprotocol) else {
            debug!(peer = %self.id.short(), protocol = %msg.subprotocol, "Unknown subprotocol, dropped");
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| handler.handle(self, &msg))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    peer = %self.id.short(),
                    msg_id = %msg.id,
                    protocol = %msg.subprotocol,
                    error = %e,
                    "Failed to handle message"
                );
                if e.is_session_fatal() {
                    self.stop();
                }
            }
            Err(_) => {
                error!(peer = %self.id.short(), protocol = %msg.subprotocol, "Handler panicked");
                self.stop();
            }
        }
    }

    async fn run_reader(self: Arc<Self>, mut stream: MsgStream, handlers: HandlerRegistry) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(msg)) => self.handle_message(msg, &handlers),
                Some(Err(e)) => {
                    warn!(peer = %self.id.short(), error = %e, "Read failed");
                    break;
                }
                None => {
                    debug!(peer = %self.id.short(), "Connection closed by peer");
                    break;
                }
            }
        }
        self.stop();
    }

    async fn run_writer(self: Arc<Self>, mut sink: MsgSink, mut rx: mpsc::Receiver<MsgOrder>) {
        loop {
            let order = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                order = rx.recv() => order,
            };
            let Some(order) = order else { break };
            let msg_id = order.msg_id();
            let protocol = order.protocol();
            *self.writing_since.lock() = Some(Instant::now());
            // a stopped session must not stay parked on a blocked write
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = order.send_to(&self, &mut sink) => result,
            };
            *self.writing_since.lock() = None;
            if let Err(e) = result {
                warn!(peer = %self.id.short(), %msg_id, %protocol, error = %e, "Write failed");
                break;
            }
        }
        self.finish(sink, rx).await;
    }

    async fn finish(self: Arc<Self>, mut sink: MsgSink, mut rx: mpsc::Receiver<MsgOrder>) {
        self.stop();
        rx.close();
        while let Ok(order) = rx.try_recv() {
            order.cancel_send(&self);
        }
        let queued: Vec<TxId> = self.tx_queue.lock().drain(..).collect();
        self.env.tracer.report(NoticeReport::Fail, &queued);
        let pending: Vec<RequestInfo> = self.requests.lock().drain().map(|(_, r)| r).collect();
        for info in pending {
            if let Some(mut receiver) = info.receiver {
                receiver.on_timeout(&self);
            }
        }
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;

        self.state.store(PeerState::Stopped as u8, Ordering::Release);
        info!(peer = %self.id.short(), "Peer session stopped");
        if self.env.removed.send(self.clone()).is_err() {
            debug!(peer = %self.id.short(), "Peer manager is gone");
        }
    }

    async fn run_maintenance(self: Arc<Self>) {
        let now = Instant::now();
        let mut ping = tokio::time::interval_at(now + PING_INTERVAL, PING_INTERVAL);
        let mut tx_flush = tokio::time::interval_at(now + TX_NOTICE_INTERVAL, TX_NOTICE_INTERVAL);
        let mut sweep =
            tokio::time::interval_at(now + REQUEST_SWEEP_INTERVAL, REQUEST_SWEEP_INTERVAL);
        for tick in [&mut ping, &mut tx_flush, &mut sweep] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ping.tick() => self.send_ping(),
                _ = tx_flush.tick() => self.flush_tx_notices(),
                _ = sweep.tick() => {
                    let expired = self.sweep_requests(SYNC_WORK_TTL);
                    if expired > 0 {
                        debug!(peer = %self.id.short(), expired, "Swept stale requests");
                    }
                }
            }
        }
    }

    fn send_ping(&self) {
        let best = match self.env.chain.best_block() {
            Ok(best) => best,
            Err(e) => {
                warn!(error = %e, "Failed to read best block for ping");
                return;
            }
        };
        let ping = Ping {
            best_block_hash: best.hash,
            best_height: best.block_no(),
        };
        if let Some(order) = self.env.factory.new_request(SubProtocol::PING_REQUEST, &ping) {
            self.send_message(order);
        }
    }
}

impl fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePeer")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::framed;
    use crate::testutil::{remote_info, test_env, TestEnv};
    use crate::types::Hash32;
    use crate::wire::Payload;

    struct Collect {
        tx: mpsc::UnboundedSender<Option<Message>>,
        want: usize,
    }

    impl ResponseReceiver for Collect {
        fn receive(&mut self, msg: &Message, _peer: &RemotePeer) -> bool {
            let _ = self.tx.send(Some(msg.clone()));
            self.want -= 1;
            self.want == 0
        }
        fn on_timeout(&mut self, _peer: &RemotePeer) {
            let _ = self.tx.send(None);
        }
    }

    fn status(no: u64) -> LastStatus {
        LastStatus {
            block_hash: Hash32::digest(b"best"),
            block_no: no,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_notice_skip_policy() {
        let TestEnv { env, .. } = test_env();
        let peer = RemotePeer::new(remote_info(), status(1), env);

        // remote is far ahead: everything is skipped
        peer.update_last_status(Hash32::digest(b"b"), 100_000);
        assert!(!peer.check_block_notice(&Hash32::digest(b"a"), 10));

        // 300 behind: skipped until 300 skips accumulated
        peer.update_last_status(Hash32::digest(b"b"), 1_000);
        peer.notice.lock().skip_cnt = 0;
        for _ in 0..300 {
            assert!(!peer.check_block_notice(&Hash32::digest(b"c"), 700));
        }
        assert!(peer.check_block_notice(&Hash32::digest(b"c"), 700));
        peer.block_notice_sent(Hash32::digest(b"c"));
        assert_eq!(peer.notice.lock().skip_cnt, 0);

        // known hash and too-frequent notices are skipped
        assert!(!peer.check_block_notice(&Hash32::digest(b"c"), 1_001));
        assert!(!peer.check_block_notice(&Hash32::digest(b"d"), 1_001));
        tokio::time::advance(MIN_NEW_BLK_NOTICE_INTERVAL + Duration::from_millis(1)).await;
        assert!(peer.check_block_notice(&Hash32::digest(b"d"), 1_001));
    }

    #[tokio::test]
    async fn test_response_routed_to_receiver() {
        let TestEnv { env, .. } = test_env();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peer = RemotePeer::new(remote_info(), status(1), env);
        peer.start(framed(Box::new(local)), HandlerRegistry::new());
        let mut remote = framed(Box::new(remote));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let order = peer
            .factory()
            .new_request_with_receiver(
                SubProtocol::GET_TXS_REQUEST,
                &crate::message::GetTransactionsRequest { hashes: vec![] },
                Box::new(Collect { tx, want: 2 }),
            )
            .unwrap();
        peer.send_and_wait(order).await.unwrap();

        let req = remote.next().await.unwrap().unwrap();
        assert_eq!(req.subprotocol, SubProtocol::GET_TXS_REQUEST);
        for _ in 0..2 {
            let resp = Message::new_response(
                SubProtocol::GET_TXS_RESPONSE,
                req.id,
                bytes::Bytes::from_static(b"x"),
            );
            remote.send(resp).await.unwrap();
        }
        assert!(rx.recv().await.unwrap().is_some());
        assert!(rx.recv().await.unwrap().is_some());
        tokio::task::yield_now().await;
        assert_eq!(peer.pending_requests(), 0);
        peer.stop();
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_once() {
        let TestEnv { env, mut removed, .. } = test_env();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peer = RemotePeer::new(remote_info(), status(1), env);
        peer.start(framed(Box::new(local)), HandlerRegistry::new());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let order = peer
            .factory()
            .new_request_with_receiver(
                SubProtocol::GET_TXS_REQUEST,
                &crate::message::GetTransactionsRequest { hashes: vec![] },
                Box::new(Collect { tx, want: 1 }),
            )
            .unwrap();
        peer.send_and_wait(order).await.unwrap();
        // let the writer put it on the wire, then hang up
        let mut remote = framed(Box::new(remote));
        let _ = remote.next().await;
        drop(remote);

        let gone = removed.recv().await.unwrap();
        assert_eq!(gone.id(), peer.id());
        assert_eq!(peer.state(), PeerState::Stopped);
        assert!(rx.recv().await.unwrap().is_none());

        // later sends are released immediately
        let notice = peer.factory().new_block_notice(Hash32::digest(b"x"), 1).unwrap();
        peer.send_message(notice);
        assert!(peer
            .send_and_wait(peer.factory().new_go_away("bye").unwrap())
            .await
            .is_err());
        peer.stop();
        assert_eq!(peer.state(), PeerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_write_queue_stops_peer() {
        let TestEnv { env, mut removed, .. } = test_env();
        let (local, _remote) = tokio::io::duplex(64);
        let peer = RemotePeer::new(remote_info(), status(1), env);
        peer.start(framed(Box::new(local)), HandlerRegistry::new());

        let notice = |i: u32| {
            peer.factory()
                .new_block_notice(Hash32::digest(&i.to_be_bytes()), 2)
                .unwrap()
        };
        // the writer has not run yet: the queue fills, then every send is dropped
        let limit = WRITE_QUEUE_SIZE as u32 + MAX_DROP_COUNT;
        for i in 0..limit {
            peer.send_message(notice(i));
        }
        assert!(peer.is_running());
        peer.send_message(notice(limit));
        assert_eq!(peer.state(), PeerState::Stopping);

        let gone = removed.recv().await.unwrap();
        assert_eq!(gone.id(), peer.id());
        assert_eq!(peer.state(), PeerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_stops_peer() {
        let TestEnv { env, mut removed, .. } = test_env();
        // nobody reads the remote end, so a large frame blocks the writer
        let (local, _remote) = tokio::io::duplex(64);
        let peer = RemotePeer::new(remote_info(), status(1), env);
        peer.start(framed(Box::new(local)), HandlerRegistry::new());

        let reason = "x".repeat(1024);
        peer.send_message(peer.factory().new_go_away(&reason).unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peer.writing_since.lock().is_some());

        tokio::time::advance(WRITE_STALL_TIMEOUT + Duration::from_secs(1)).await;
        assert!(peer.is_running());
        // the first rejected enqueue notices the stall
        let mut sent = 0;
        while peer.is_running() && sent <= WRITE_QUEUE_SIZE {
            let notice = peer.factory().new_block_notice(Hash32::digest(b"late"), 2).unwrap();
            peer.send_message(notice);
            sent += 1;
        }
        assert_eq!(peer.state(), PeerState::Stopping);
        assert!(peer.drop_count.load(Ordering::Relaxed) <= 1);

        let gone = removed.recv().await.unwrap();
        assert_eq!(gone.id(), peer.id());
        assert_eq!(peer.state(), PeerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_requests() {
        let TestEnv { env, .. } = test_env();
        let peer = RemotePeer::new(remote_info(), status(1), env);
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.register_request(
            MsgId::new(),
            SubProtocol::GET_TXS_REQUEST,
            Some(Box::new(Collect { tx, want: 1 })),
        );
        assert_eq!(peer.sweep_requests(SYNC_WORK_TTL), 0);
        tokio::time::advance(SYNC_WORK_TTL + Duration::from_secs(1)).await;
        assert_eq!(peer.sweep_requests(SYNC_WORK_TTL), 1);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tx_notice_flush_skips_known() {
        let TestEnv { env, .. } = test_env();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peer = RemotePeer::new(remote_info(), status(1), env);
        peer.start(framed(Box::new(local)), HandlerRegistry::new());
        let mut remote = framed(Box::new(remote));

        let known = Hash32::digest(b"known");
        let fresh = Hash32::digest(b"fresh");
        peer.mark_txs_known(&[known]);
        peer.push_txs_notice(&[known, fresh]);
        peer.flush_tx_notices();

        let msg = remote.next().await.unwrap().unwrap();
        assert_eq!(msg.subprotocol, SubProtocol::NEW_TX_NOTICE);
        let body = crate::message::NewTransactionsNotice::decode(&msg.payload).unwrap();
        assert_eq!(body.tx_hashes, vec![fresh]);
        peer.stop();
    }
}
