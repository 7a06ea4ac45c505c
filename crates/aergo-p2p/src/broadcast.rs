//! Fan-out of block and transaction notices to connected peers.

use crate::order::{MsgOrder, MsgOrderFactory};
use crate::peer::{PeerState, RemotePeer};
use crate::role::RoleManager;
use crate::tracer::{NoticeReport, TxNoticeTracer};
use crate::types::{Block, BlockId, PeerId, PeerZone, TxId};
use crate::MAX_REQUEST_HASHES;
use std::sync::Arc;
use tracing::debug;

/// Hashes per slice of a slow tx notice push.
pub const SLOW_PUSH_SLICE: usize = MAX_REQUEST_HASHES;

/// Outcome counts of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub sent: usize,
    pub skipped: usize,
}

/// Queue a copy of `order` on every running peer that does not know
/// `hash` yet.
pub(crate) fn fan_out(order: &MsgOrder, peers: &[Arc<RemotePeer>], hash: Option<&BlockId>) -> FanOut {
    let mut result = FanOut::default();
    for peer in peers {
        if !peer.is_running() || hash.map_or(false, |h| peer.knows_block(h)) {
            result.skipped += 1;
            continue;
        }
        match order.try_clone() {
            Some(copy) => {
                peer.send_message(copy);
                result.sent += 1;
            }
            None => result.skipped += 1,
        }
    }
    result
}

/// Announce a block accepted by the local chain.
pub(crate) fn notify_new_block(
    factory: &MsgOrderFactory,
    role: &dyn RoleManager,
    peers: Vec<Arc<RemotePeer>>,
    block: &Block,
) -> FanOut {
    let Some(order) = factory.new_block_notice(block.hash, block.block_no()) else {
        return FanOut::default();
    };
    let receivers = role.filter_new_block_notice_receiver(block, peers);
    let result = fan_out(&order, &receivers, Some(&block.hash));
    debug!(block = %block.hash, no = block.block_no(), sent = result.sent, skipped = result.skipped, "Noticed new block");
    result
}

/// Push a block this node (or the producer it fronts) just produced.
pub(crate) fn notify_block_produced(
    factory: &MsgOrderFactory,
    role: &dyn RoleManager,
    peers: Vec<Arc<RemotePeer>>,
    producer: PeerId,
    block: &Block,
) -> FanOut {
    let Some(order) = factory.new_bp_notice(producer, block) else {
        return FanOut::default();
    };
    let receivers = role.filter_bp_notice_receiver(block, peers, PeerZone::External);
    let result = fan_out(&order, &receivers, Some(&block.hash));
    debug!(block = %block.hash, sent = result.sent, skipped = result.skipped, "Pushed produced block");
    result
}

/// Relay a produced-block notice from an internal producer to the
/// external zone without re-encoding it.
pub(crate) fn relay_bp_notice(
    factory: &MsgOrderFactory,
    role: &dyn RoleManager,
    peers: Vec<Arc<RemotePeer>>,
    from: PeerId,
    block: &Block,
    msg: crate::codec::Message,
) -> FanOut {
    let order = factory.new_toss(msg);
    let peers = peers.into_iter().filter(|p| p.id() != from).collect();
    let receivers = role.filter_bp_notice_receiver(block, peers, PeerZone::External);
    fan_out(&order, &receivers, Some(&block.hash))
}

/// Queue tx hashes on every running peer and register them with the
/// tracer. Long lists are pushed in slices from a background task.
pub(crate) fn notify_new_txs(
    tracer: &TxNoticeTracer,
    peers: Vec<Arc<RemotePeer>>,
    hashes: Vec<TxId>,
) -> usize {
    if hashes.is_empty() {
        return 0;
    }
    let running: Vec<Arc<RemotePeer>> = peers.into_iter().filter(|p| p.is_running()).collect();
    tracer.register_tx_notice(&hashes, running.len());
    let count = running.len();
    if hashes.len() <= SLOW_PUSH_SLICE {
        for peer in running {
            peer.push_txs_notice(&hashes);
        }
    } else {
        let hashes: Arc<[TxId]> = hashes.into();
        for peer in running {
            tokio::spawn(slow_push(peer, hashes.clone()));
        }
    }
    count
}

/// Push `hashes` to one peer slice by slice, giving up when the session
/// leaves the running state. Unpushed hashes are reported as failed.
pub(crate) async fn slow_push(peer: Arc<RemotePeer>, hashes: Arc<[TxId]>) {
    let mut chunks = hashes.chunks(SLOW_PUSH_SLICE);
    while let Some(chunk) = chunks.next() {
        if peer.state() != PeerState::Running {
            let rest: Vec<TxId> = std::iter::once(chunk)
                .chain(chunks)
                .flatten()
                .copied()
                .collect();
            debug!(peer = %peer.id().short(), left = rest.len(), "Peer left, tx push stopped");
            peer.env().tracer.report(NoticeReport::Fail, &rest);
            return;
        }
        peer.push_txs_notice(chunk);
        tokio::task::yield_now().await;
    }
}
