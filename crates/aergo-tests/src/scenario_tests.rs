//! End-to-end scenarios over in-memory streams and loopback services.

use crate::harness::*;
use aergo_p2p::cert::{
    new_certificate_manager, AgentCertificate, CertificateManager, CERT_TTL,
};
use aergo_p2p::handlers::HandlerRegistry;
use aergo_p2p::message::GetBlockResponse;
use aergo_p2p::sync::SyncManager;
use aergo_p2p::types::now_unix_nanos;
use aergo_p2p::waiting::{backoff_delay, WaitingPeerManager, FIRST_RECONNECT_DELAY};
use aergo_p2p::{
    MsgId, MsgOrderFactory, NetworkError, NodeKey, P2PCommand, P2PVersion, PeerManagerHandle,
    PeerMeta, PeerRole, PeerState, ResultStatus, Tx,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const HOUR: i64 = 3_600_000_000_000;

#[tokio::test]
async fn version_downgrade_ends_running() {
    let (ka, kb) = (NodeKey::generate(), NodeKey::generate());
    let chain = Arc::new(MockChain::new(3));
    let a = handshaker(&ka, chain.clone()).with_versions(vec![
        P2PVersion::V200,
        P2PVersion::V033,
        P2PVersion::V032,
        P2PVersion::V031,
    ]);
    let b = handshaker(&kb, chain.clone()).with_versions(vec![P2PVersion::V032]);

    let (sa, sb) = duplex_pair();
    let b_id = kb.id();
    let a_id = ka.id();
    let out = tokio::spawn(async move { a.outbound(sa, b_id).await });
    let inb = tokio::spawn(async move { b.inbound(sb, a_id).await });
    let out = out.await.unwrap().unwrap();
    let inb = inb.await.unwrap().unwrap();
    assert_eq!(out.version, P2PVersion::V032);
    assert_eq!(inb.version, P2PVersion::V032);
    assert_eq!(out.best_no, 2);

    let mut fa = session_fixture(chain.clone());
    let fb = session_fixture(chain);
    let peer_b = peer_from_handshake(&out, true, fa.env.clone());
    let peer_a = peer_from_handshake(&inb, false, fb.env.clone());
    peer_b.start(out.framed, HandlerRegistry::new());
    peer_a.start(inb.framed, HandlerRegistry::new());
    assert_eq!(peer_b.state(), PeerState::Running);
    assert_eq!(peer_a.state(), PeerState::Running);
    assert_eq!(peer_b.id(), kb.id());

    peer_a.stop();
    let removed = tokio::time::timeout(Duration::from_secs(5), fa.removed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(removed.id(), kb.id());
    assert_eq!(peer_b.state(), PeerState::Stopped);
}

#[tokio::test]
async fn no_common_version_closes_both() {
    let (ka, kb) = (NodeKey::generate(), NodeKey::generate());
    let chain = Arc::new(MockChain::new(1));
    let a = handshaker(&ka, chain.clone()).with_versions(vec![P2PVersion::V200, P2PVersion::V033]);
    let b = handshaker(&kb, chain).with_versions(vec![P2PVersion::V030]);

    let (sa, sb) = duplex_pair();
    let (a_id, b_id) = (ka.id(), kb.id());
    let out = tokio::spawn(async move { a.outbound(sa, b_id).await });
    let inb = tokio::spawn(async move { b.inbound(sb, a_id).await });
    assert!(matches!(out.await.unwrap(), Err(NetworkError::NoMatchedVersion)));
    assert!(matches!(inb.await.unwrap(), Err(NetworkError::NoMatchedVersion)));
}

#[tokio::test]
async fn block_notice_fetched_and_dispatched_once() {
    let chain = Arc::new(MockChain::new(2));
    let actor = Arc::new(MockActor::default());
    let (peers, _events) = PeerManagerHandle::detached();
    let (commands_tx, mut commands) = mpsc::channel(16);
    let (sync, _task) = SyncManager::new(
        chain.clone(),
        actor.clone(),
        peers,
        MsgOrderFactory::new(),
        commands_tx,
    );

    let block = chain.next_block();
    let senders: Vec<_> = (0..3).map(|_| NodeKey::generate().id()).collect();
    for id in &senders {
        sync.handle_new_block_notice(*id, block.hash, block.block_no());
    }
    match commands.try_recv() {
        Ok(P2PCommand::GetBlockInfos { to, hashes }) => {
            assert_eq!(to, senders[0]);
            assert_eq!(hashes, vec![block.hash]);
        }
        other => panic!("unexpected command: {:?}", other),
    }
    assert!(commands.try_recv().is_err());

    let resp = GetBlockResponse {
        status: ResultStatus::Ok,
        blocks: vec![block.clone()],
        has_next: false,
    };
    sync.handle_get_block_response(senders[0], MsgId::new(), resp.clone());
    sync.handle_get_block_response(senders[1], MsgId::new(), resp);
    sync.handle_new_block_notice(senders[2], block.hash, block.block_no());
    assert!(!sync.handle_block_produced_notice(senders[2], block.clone()));

    assert_eq!(actor.added_count(&block.hash), 1);
    assert!(commands.try_recv().is_err());
}

#[tokio::test]
async fn block_notices_from_three_nodes_fetch_once() {
    let hub = TestNode::spawn(Vec::new());
    let shared = hub.chain.next_block();

    let mut leaves = Vec::new();
    for _ in 0..3 {
        let chain = Arc::new(MockChain::new(3));
        chain.append(shared.clone());
        let node = TestNode::start(
            node_config(free_port(), vec![hub.multiaddr()]),
            chain,
            Arc::new(MockActor::default()),
        );
        assert!(node.wait_connected(hub.id).await);
        leaves.push(node);
    }
    for leaf in &leaves {
        assert!(hub.wait_connected(leaf.id).await);
    }

    for leaf in &leaves {
        leaf.handle.notify_new_block(shared.clone()).await.unwrap();
    }
    let actor = hub.actor.clone();
    let hash = shared.hash;
    assert!(
        wait_until(Duration::from_secs(5), || {
            let actor = actor.clone();
            async move { actor.added_count(&hash) > 0 }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.actor.added_count(&shared.hash), 1);

    for leaf in leaves {
        leaf.stop().await;
    }
    hub.stop().await;
}

#[tokio::test]
async fn tx_notice_pulls_bodies() {
    let txs: Vec<Tx> = (0..20)
        .map(|i| Tx::new(Bytes::from(format!("relay-tx-{}", i))))
        .collect();
    let source = TestNode::start(
        node_config(free_port(), Vec::new()),
        Arc::new(MockChain::new(3)),
        Arc::new(MockActor::with_txs(&txs)),
    );
    let sink = TestNode::spawn(vec![source.multiaddr()]);
    assert!(sink.wait_connected(source.id).await);
    assert!(source.wait_connected(sink.id).await);

    source.handle.notify_new_txs(txs.clone()).await.unwrap();
    let actor = sink.actor.clone();
    let expected = txs.len();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let actor = actor.clone();
            async move { actor.put_txs.lock().len() >= expected }
        })
        .await
    );
    let received = sink.actor.put_txs.lock().clone();
    assert_eq!(received.len(), txs.len());
    for tx in &txs {
        assert!(received.contains(tx));
    }

    sink.stop().await;
    source.stop().await;
}

#[test]
fn agent_certificate_lifecycle() {
    let bp_key = NodeKey::generate();
    let agent_key = NodeKey::generate();

    let mut bp_meta = loopback_meta(&bp_key, 7846);
    bp_meta.role = PeerRole::Producer;
    let (bp_cmds, _bp_rx) = mpsc::channel(4);
    let bp = new_certificate_manager(bp_meta, *bp_key.secret(), bp_cmds);

    let mut agent_meta = loopback_meta(&agent_key, 7847);
    agent_meta.role = PeerRole::Agent;
    agent_meta.producer_ids = vec![bp_key.id()];
    let (agent_cmds, mut agent_rx) = mpsc::channel(8);
    let agent = new_certificate_manager(agent_meta.clone(), *agent_key.secret(), agent_cmds);

    let issued = bp.create_certificate(&agent_meta).unwrap();
    assert_eq!(issued.expire_time - issued.create_time, 24 * HOUR);
    assert!(issued.verify());

    // agents cannot issue
    assert!(matches!(
        agent.create_certificate(&agent_meta),
        Err(NetworkError::InvalidRole)
    ));

    let created = now_unix_nanos();
    let cert = AgentCertificate::new_v1_at(
        bp_key.secret(),
        agent_key.id(),
        vec!["127.0.0.1".to_string()],
        CERT_TTL,
        created,
    )
    .unwrap();
    agent.add_certificate(cert.clone());
    assert!(matches!(
        agent_rx.try_recv(),
        Ok(P2PCommand::NotifyCertRenewed { .. })
    ));
    assert_eq!(agent.get_certificates(), vec![cert.clone()]);

    agent.sweep(created + 12 * HOUR + 1_000_000_000);
    match agent_rx.try_recv() {
        Ok(P2PCommand::IssueCertificate { bp_id }) => assert_eq!(bp_id, bp_key.id()),
        other => panic!("expected reissue request, got {:?}", other),
    }
    assert_eq!(agent.get_certificates(), vec![cert]);

    agent.sweep(created + 24 * HOUR + 1);
    assert!(agent.get_certificates().is_empty());
}

#[test]
fn designated_peer_reconnect_schedule() {
    let start = Instant::now();
    let mut wm = WaitingPeerManager::new(NodeKey::generate().id(), false, 10);
    let mut d = PeerMeta::with_id(NodeKey::generate().id());
    d.addresses = vec![aergo_p2p::NetAddr::new("10.0.0.7", 7846)];
    d.designated = true;

    wm.on_peer_disconnect(&d, start);
    let first = start + FIRST_RECONNECT_DELAY;
    assert_eq!(wm.get(&d.id).map(|w| w.next_trial), Some(first));

    let mut now = first;
    let mut attempts = vec![now];
    for _ in 0..3 {
        assert_eq!(wm.next_dials(now, 0).len(), 1);
        wm.on_work_done(&d.id, Err("connection refused".into()), now);
        now = wm.get(&d.id).unwrap().next_trial;
        attempts.push(now);
    }
    // fourth try waits about two minutes
    assert_eq!(attempts[3] - attempts[2], Duration::from_secs(121));

    for _ in 0..20 {
        wm.next_dials(now, 0);
        wm.on_work_done(&d.id, Err("connection refused".into()), now);
        now = wm.get(&d.id).unwrap().next_trial;
    }
    wm.next_dials(now, 0);
    wm.on_work_done(&d.id, Err("connection refused".into()), now);
    let gap = wm.get(&d.id).unwrap().next_trial - now;
    assert_eq!(gap, backoff_delay(14));
    assert!(gap >= Duration::from_secs(23 * 3600) && gap <= Duration::from_secs(25 * 3600));
}

#[tokio::test]
async fn simultaneous_dials_keep_one_session() {
    let (ka, kb) = (NodeKey::generate(), NodeKey::generate());
    let (pa, pb) = (free_port(), free_port());
    let addr_a = aergo_p2p::types::to_multiaddr(&aergo_p2p::NetAddr::new("127.0.0.1", pa), &ka.id());
    let addr_b = aergo_p2p::types::to_multiaddr(&aergo_p2p::NetAddr::new("127.0.0.1", pb), &kb.id());
    let a = TestNode::start_with_key(
        ka,
        node_config(pa, vec![addr_b]),
        Arc::new(MockChain::new(3)),
        Arc::new(MockActor::default()),
    );
    let b = TestNode::start_with_key(
        kb,
        node_config(pb, vec![addr_a]),
        Arc::new(MockChain::new(3)),
        Arc::new(MockActor::default()),
    );

    assert!(a.wait_connected(b.id).await);
    assert!(b.wait_connected(a.id).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let on_a = a.peers().await;
    let on_b = b.peers().await;
    assert_eq!(on_a.len(), 1);
    assert_eq!(on_b.len(), 1);
    assert_ne!(on_a[0].outbound, on_b[0].outbound);
    // the smaller id holds the inbound end
    let (smaller_side, _) = if a.id < b.id { (&on_a, &on_b) } else { (&on_b, &on_a) };
    assert!(!smaller_side[0].outbound);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn stopped_peer_is_removed_from_other_side() {
    let hub = TestNode::spawn(Vec::new());
    let leaf = TestNode::spawn(vec![hub.multiaddr()]);
    assert!(hub.wait_connected(leaf.id).await);

    let leaf_id = leaf.id;
    leaf.stop().await;
    let hub_ref = &hub;
    assert!(
        wait_until(Duration::from_secs(5), || async move {
            hub_ref.peers().await.iter().all(|p| p.meta.id != leaf_id)
        })
        .await
    );
    hub.stop().await;
}
