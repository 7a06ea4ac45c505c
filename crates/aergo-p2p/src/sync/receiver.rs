//! Consumer of the fragments answering one tx pull.

use super::tx::TxEvent;
use crate::actor::ActorService;
use crate::codec::Message;
use crate::message::GetTransactionsResponse;
use crate::order::ResponseReceiver;
use crate::peer::RemotePeer;
use crate::types::{PeerId, ResultStatus, TxId};
use crate::wire::Payload;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Waiting,
    /// Gave up on the request; later fragments are swallowed.
    Canceled,
    Finished,
}

/// Matches the returned transactions against the requested hashes.
///
/// Responses must follow the request order. Requested hashes the remote
/// skipped are collected and released back to the front cache when the
/// exchange ends, so another peer can be asked.
pub struct GetTxsReceiver {
    peer: PeerId,
    hashes: Vec<TxId>,
    offset: usize,
    missed: Vec<TxId>,
    state: ReceiveState,
    actor: Arc<dyn ActorService>,
    events: mpsc::UnboundedSender<TxEvent>,
}

impl GetTxsReceiver {
    pub(crate) fn new(
        peer: PeerId,
        hashes: Vec<TxId>,
        actor: Arc<dyn ActorService>,
        events: mpsc::UnboundedSender<TxEvent>,
    ) -> Self {
        Self {
            peer,
            hashes,
            offset: 0,
            missed: Vec::new(),
            state: ReceiveState::Waiting,
            actor,
            events,
        }
    }

    fn emit(&self, event: TxEvent) {
        if self.events.send(event).is_err() {
            debug!("Tx sync manager is stopped");
        }
    }

    fn unprocessed(&mut self) -> Vec<TxId> {
        let mut rest = std::mem::take(&mut self.missed);
        rest.extend_from_slice(&self.hashes[self.offset.min(self.hashes.len())..]);
        self.offset = self.hashes.len();
        rest
    }

    fn cancel(&mut self) {
        self.state = ReceiveState::Canceled;
        let hashes = self.unprocessed();
        if !hashes.is_empty() {
            self.emit(TxEvent::Burn { hashes });
        }
    }

    fn finish(&mut self) {
        self.state = ReceiveState::Finished;
        let hashes = self.unprocessed();
        if !hashes.is_empty() {
            debug!(peer = %self.peer.short(), missed = hashes.len(), "Tx pull finished with missing txs");
            self.emit(TxEvent::Burn { hashes });
        }
    }

    /// Advance to `hash` in the request order. Skipped hashes are missed.
    fn seek(&mut self, hash: &TxId) -> bool {
        while self.offset < self.hashes.len() {
            let expected = self.hashes[self.offset];
            self.offset += 1;
            if &expected == hash {
                return true;
            }
            self.missed.push(expected);
        }
        false
    }
}

impl ResponseReceiver for GetTxsReceiver {
    fn receive(&mut self, msg: &Message, _peer: &RemotePeer) -> bool {
        let resp = match GetTransactionsResponse::decode(&msg.payload) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(peer = %self.peer.short(), msg_id = %msg.id, error = %e, "Invalid tx response");
                if self.state == ReceiveState::Waiting {
                    self.cancel();
                }
                return true;
            }
        };
        if self.state != ReceiveState::Waiting {
            return !resp.has_next;
        }

        if resp.status != ResultStatus::Ok {
            if resp.status == ResultStatus::ResourceExhausted {
                debug!(peer = %self.peer.short(), "Remote is busy, tx pull will be retried");
                self.state = ReceiveState::Canceled;
                let hashes = self.unprocessed();
                self.emit(TxEvent::Retry {
                    peer: self.peer,
                    hashes,
                });
            } else {
                debug!(peer = %self.peer.short(), status = ?resp.status, "Tx pull rejected");
                self.cancel();
            }
            return !resp.has_next;
        }
        if resp.txs.is_empty() || resp.txs.len() != resp.hashes.len() {
            debug!(peer = %self.peer.short(), "Empty or malformed tx response");
            self.cancel();
            return !resp.has_next;
        }

        for (hash, tx) in resp.hashes.iter().zip(resp.txs) {
            if !self.seek(hash) {
                warn!(peer = %self.peer.short(), "Remote sent more txs than requested");
                self.cancel();
                return !resp.has_next;
            }
            if tx.hash != *hash {
                warn!(peer = %self.peer.short(), tx = %hash, "Tx body does not match its hash");
                self.missed.push(*hash);
                continue;
            }
            self.actor.mempool_put(tx);
        }

        if resp.has_next {
            return false;
        }
        self.finish();
        true
    }

    fn on_timeout(&mut self, _peer: &RemotePeer) {
        if self.state == ReceiveState::Waiting {
            debug!(peer = %self.peer.short(), "Tx pull timed out");
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LastStatus;
    use crate::testutil::{remote_info, test_env, TestActor};
    use crate::types::{Hash32, Tx};

    fn txs(n: usize) -> Vec<Tx> {
        (0..n).map(|i| Tx::new(format!("tx{}", i).into_bytes())).collect()
    }

    fn response(status: ResultStatus, txs: &[Tx], has_next: bool) -> Message {
        let body = GetTransactionsResponse {
            status,
            hashes: txs.iter().map(|t| t.hash).collect(),
            txs: txs.to_vec(),
            has_next,
        };
        Message::new_response(
            crate::SubProtocol::GET_TXS_RESPONSE,
            crate::MsgId::new(),
            body.encode().unwrap(),
        )
    }

    struct Fixture {
        actor: Arc<TestActor>,
        events: mpsc::UnboundedReceiver<TxEvent>,
        peer: Arc<RemotePeer>,
        receiver: GetTxsReceiver,
    }

    fn fixture(requested: &[Tx]) -> Fixture {
        let actor = Arc::new(TestActor::default());
        let (tx, events) = mpsc::unbounded_channel();
        let peer = RemotePeer::new(
            remote_info(),
            LastStatus {
                block_hash: Hash32::default(),
                block_no: 0,
            },
            test_env().env,
        );
        let receiver = GetTxsReceiver::new(
            peer.id(),
            requested.iter().map(|t| t.hash).collect(),
            actor.clone(),
            tx,
        );
        Fixture {
            actor,
            events,
            peer,
            receiver,
        }
    }

    #[tokio::test]
    async fn test_chunks_forwarded_in_order() {
        let all = txs(4);
        let mut f = fixture(&all);
        assert!(!f.receiver.receive(&response(ResultStatus::Ok, &all[..2], true), &f.peer));
        assert!(f.receiver.receive(&response(ResultStatus::Ok, &all[2..], false), &f.peer));
        assert_eq!(f.actor.put_txs.lock().len(), 4);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_skipped_hashes_are_burned() {
        let all = txs(4);
        let mut f = fixture(&all);
        let partial = vec![all[1].clone(), all[3].clone()];
        assert!(f.receiver.receive(&response(ResultStatus::Ok, &partial, false), &f.peer));
        assert_eq!(f.actor.put_txs.lock().len(), 2);
        match f.events.try_recv().unwrap() {
            TxEvent::Burn { hashes } => assert_eq!(hashes, vec![all[0].hash, all[2].hash]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_busy_remote_requests_retry() {
        let all = txs(3);
        let mut f = fixture(&all);
        assert!(f
            .receiver
            .receive(&response(ResultStatus::ResourceExhausted, &[], false), &f.peer));
        match f.events.try_recv().unwrap() {
            TxEvent::Retry { peer, hashes } => {
                assert_eq!(peer, f.peer.id());
                assert_eq!(hashes.len(), 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
        // nothing left to release on teardown
        f.receiver.on_timeout(&f.peer);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_extra_txs_cancel_and_swallow_rest() {
        let requested = txs(1);
        let mut f = fixture(&requested);
        let mut sent = requested.clone();
        sent.push(Tx::new(b"unrequested".to_vec()));
        assert!(!f.receiver.receive(&response(ResultStatus::Ok, &sent, true), &f.peer));
        assert_eq!(f.actor.put_txs.lock().len(), 1);
        assert!(!f.receiver.receive(&response(ResultStatus::Ok, &sent, true), &f.peer));
        assert!(f.receiver.receive(&response(ResultStatus::Ok, &sent, false), &f.peer));
        assert_eq!(f.actor.put_txs.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_releases_unreceived() {
        let all = txs(3);
        let mut f = fixture(&all);
        assert!(!f.receiver.receive(&response(ResultStatus::Ok, &all[..1], true), &f.peer));
        f.receiver.on_timeout(&f.peer);
        match f.events.try_recv().unwrap() {
            TxEvent::Burn { hashes } => assert_eq!(hashes, vec![all[1].hash, all[2].hash]),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
