//! Outgoing message orders.
//!
//! An order wraps a framed message with the bookkeeping that must run
//! when the peer's writer puts it on the wire, or when the session drops
//! it without writing.

use crate::codec::{Message, MsgId};
use crate::message::{
    BlockProducedNotice, GoAwayNotice, NewBlockNotice, NewTransactionsNotice, RaftWrapperMessage,
    SubProtocol,
};
use crate::peer::RemotePeer;
use crate::tracer::NoticeReport;
use crate::types::{Block, BlockId, PeerId, TxId};
use crate::wire::Payload;
use crate::NetworkResult;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use std::fmt;
use tracing::{debug, warn};

/// Maximum hashes in one transaction notice.
pub const MAX_TX_NOTICE_HASHES: usize = 2000;

/// Callback consuming the responses of one request.
pub trait ResponseReceiver: Send {
    /// Handle one response fragment. Returns `true` once no further
    /// fragments are expected.
    fn receive(&mut self, msg: &Message, peer: &RemotePeer) -> bool;

    /// The request expired or the session ended before it completed.
    fn on_timeout(&mut self, peer: &RemotePeer);
}

/// A message queued for a peer's writer.
pub enum MsgOrder {
    Request {
        msg: Message,
        receiver: Option<Box<dyn ResponseReceiver>>,
    },
    Response {
        msg: Message,
    },
    /// Unsolicited message that expects no answer.
    Notice {
        msg: Message,
    },
    BlockNotice {
        msg: Message,
        hash: BlockId,
        block_no: u64,
    },
    BpNotice {
        msg: Message,
        hash: BlockId,
    },
    TxNotice {
        msg: Message,
        hashes: Vec<TxId>,
    },
    Raft {
        msg: Message,
    },
    /// Relay of an already framed message.
    Toss {
        msg: Message,
    },
}

impl MsgOrder {
    pub fn message(&self) -> &Message {
        match self {
            MsgOrder::Request { msg, .. }
            | MsgOrder::Response { msg }
            | MsgOrder::Notice { msg }
            | MsgOrder::BlockNotice { msg, .. }
            | MsgOrder::BpNotice { msg, .. }
            | MsgOrder::TxNotice { msg, .. }
            | MsgOrder::Raft { msg }
            | MsgOrder::Toss { msg } => msg,
        }
    }

    pub fn msg_id(&self) -> MsgId {
        self.message().id
    }

    pub fn protocol(&self) -> SubProtocol {
        self.message().subprotocol
    }

    pub fn is_request(&self) -> bool {
        matches!(self, MsgOrder::Request { .. })
    }

    /// Relayed messages keep the origin's framing untouched.
    pub fn is_need_sign(&self) -> bool {
        !matches!(self, MsgOrder::Toss { .. })
    }

    pub fn timestamp(&self) -> i64 {
        self.message().timestamp
    }

    /// Duplicate the order for another peer. Requests with a receiver
    /// are bound to one peer and cannot be duplicated.
    pub fn try_clone(&self) -> Option<MsgOrder> {
        let order = match self {
            MsgOrder::Request { receiver: Some(_), .. } => return None,
            MsgOrder::Request { msg, receiver: None } => MsgOrder::Request {
                msg: msg.clone(),
                receiver: None,
            },
            MsgOrder::Response { msg } => MsgOrder::Response { msg: msg.clone() },
            MsgOrder::Notice { msg } => MsgOrder::Notice { msg: msg.clone() },
            MsgOrder::BlockNotice {
                msg,
                hash,
                block_no,
            } => MsgOrder::BlockNotice {
                msg: msg.clone(),
                hash: *hash,
                block_no: *block_no,
            },
            MsgOrder::BpNotice { msg, hash } => MsgOrder::BpNotice {
                msg: msg.clone(),
                hash: *hash,
            },
            MsgOrder::TxNotice { msg, hashes } => MsgOrder::TxNotice {
                msg: msg.clone(),
                hashes: hashes.clone(),
            },
            MsgOrder::Raft { msg } => MsgOrder::Raft { msg: msg.clone() },
            MsgOrder::Toss { msg } => MsgOrder::Toss { msg: msg.clone() },
        };
        Some(order)
    }

    /// Write the order to `sink`, running the per-kind bookkeeping.
    ///
    /// A block notice the remote does not need is consumed without
    /// writing anything.
    pub async fn send_to<S>(self, peer: &RemotePeer, sink: &mut S) -> NetworkResult<()>
    where
        S: Sink<Message, Error = crate::NetworkError> + Unpin,
    {
        match self {
            MsgOrder::Request { msg, receiver } => {
                peer.register_request(msg.id, msg.subprotocol, receiver);
                sink.send(msg).await
            }
            MsgOrder::Response { msg } | MsgOrder::Notice { msg } | MsgOrder::Toss { msg } => {
                sink.send(msg).await
            }
            MsgOrder::BlockNotice {
                msg,
                hash,
                block_no,
            } => {
                if !peer.check_block_notice(&hash, block_no) {
                    return Ok(());
                }
                sink.send(msg).await?;
                peer.block_notice_sent(hash);
                Ok(())
            }
            MsgOrder::BpNotice { msg, hash } => {
                sink.send(msg).await?;
                peer.mark_block_known(hash);
                Ok(())
            }
            MsgOrder::TxNotice { msg, hashes } => match sink.send(msg).await {
                Ok(()) => {
                    peer.mark_txs_known(&hashes);
                    peer.env().tracer.report(NoticeReport::Send, &hashes);
                    Ok(())
                }
                Err(e) => {
                    peer.env().tracer.report(NoticeReport::Fail, &hashes);
                    Err(e)
                }
            },
            MsgOrder::Raft { msg } => {
                let result = sink.send(msg).await;
                if result.is_err() {
                    if let Some(raft) = &peer.env().raft {
                        raft.report_unreachable(peer.id());
                    }
                }
                result
            }
        }
    }

    /// Release an order that will never be written.
    pub fn cancel_send(self, peer: &RemotePeer) {
        match self {
            MsgOrder::Request {
                receiver: Some(mut receiver),
                ..
            } => receiver.on_timeout(peer),
            MsgOrder::TxNotice { hashes, .. } => {
                peer.env().tracer.report(NoticeReport::Fail, &hashes);
            }
            MsgOrder::Raft { .. } => {
                if let Some(raft) = &peer.env().raft {
                    raft.report_unreachable(peer.id());
                }
            }
            other => {
                debug!(
                    peer = %peer.id().short(),
                    msg_id = %other.msg_id(),
                    protocol = %other.protocol(),
                    "Message not sent"
                );
            }
        }
    }
}

impl fmt::Debug for MsgOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgOrder")
            .field("protocol", &self.protocol())
            .field("msg_id", &self.msg_id())
            .field("request", &self.is_request())
            .finish()
    }
}

/// Builds orders from message bodies.
///
/// Every constructor returns `None` when the body cannot be encoded;
/// the failure is logged here and callers just drop the message.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgOrderFactory;

impl MsgOrderFactory {
    pub fn new() -> Self {
        Self
    }

    fn encode<P: Payload>(&self, protocol: SubProtocol, body: &P) -> Option<Bytes> {
        match body.encode() {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(%protocol, error = %e, "Failed to encode message body");
                None
            }
        }
    }

    pub fn new_request<P: Payload>(&self, protocol: SubProtocol, body: &P) -> Option<MsgOrder> {
        let payload = self.encode(protocol, body)?;
        Some(MsgOrder::Request {
            msg: Message::new(protocol, payload),
            receiver: None,
        })
    }

    pub fn new_request_with_receiver<P: Payload>(
        &self,
        protocol: SubProtocol,
        body: &P,
        receiver: Box<dyn ResponseReceiver>,
    ) -> Option<MsgOrder> {
        let payload = self.encode(protocol, body)?;
        Some(MsgOrder::Request {
            msg: Message::new(protocol, payload),
            receiver: Some(receiver),
        })
    }

    pub fn new_response<P: Payload>(
        &self,
        original_id: MsgId,
        protocol: SubProtocol,
        body: &P,
    ) -> Option<MsgOrder> {
        let payload = self.encode(protocol, body)?;
        Some(MsgOrder::Response {
            msg: Message::new_response(protocol, original_id, payload),
        })
    }

    pub fn new_notice<P: Payload>(&self, protocol: SubProtocol, body: &P) -> Option<MsgOrder> {
        let payload = self.encode(protocol, body)?;
        Some(MsgOrder::Notice {
            msg: Message::new(protocol, payload),
        })
    }

    pub fn new_go_away(&self, reason: &str) -> Option<MsgOrder> {
        self.new_notice(
            SubProtocol::GO_AWAY,
            &GoAwayNotice {
                message: reason.to_string(),
            },
        )
    }

    pub fn new_block_notice(&self, block_hash: BlockId, block_no: u64) -> Option<MsgOrder> {
        let body = NewBlockNotice {
            block_hash,
            block_no,
        };
        let payload = self.encode(SubProtocol::NEW_BLOCK_NOTICE, &body)?;
        Some(MsgOrder::BlockNotice {
            msg: Message::new(SubProtocol::NEW_BLOCK_NOTICE, payload),
            hash: block_hash,
            block_no,
        })
    }

    pub fn new_bp_notice(&self, producer_id: PeerId, block: &Block) -> Option<MsgOrder> {
        let body = BlockProducedNotice {
            producer_id,
            block_no: block.block_no(),
            block: block.clone(),
        };
        let payload = self.encode(SubProtocol::BLOCK_PRODUCED_NOTICE, &body)?;
        Some(MsgOrder::BpNotice {
            msg: Message::new(SubProtocol::BLOCK_PRODUCED_NOTICE, payload),
            hash: block.hash,
        })
    }

    pub fn new_tx_notice(&self, hashes: Vec<TxId>) -> Option<MsgOrder> {
        let body = NewTransactionsNotice {
            tx_hashes: hashes.clone(),
        };
        let payload = self.encode(SubProtocol::NEW_TX_NOTICE, &body)?;
        Some(MsgOrder::TxNotice {
            msg: Message::new(SubProtocol::NEW_TX_NOTICE, payload),
            hashes,
        })
    }

    pub fn new_raft(&self, body: &RaftWrapperMessage) -> Option<MsgOrder> {
        let payload = self.encode(SubProtocol::RAFT_WRAPPER, body)?;
        Some(MsgOrder::Raft {
            msg: Message::new(SubProtocol::RAFT_WRAPPER, payload),
        })
    }

    pub fn new_toss(&self, msg: Message) -> MsgOrder {
        MsgOrder::Toss { msg }
    }
}
