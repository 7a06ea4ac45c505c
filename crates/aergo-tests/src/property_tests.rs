//! Property-based tests using proptest.
//!
//! Framing, reconnect backoff and the certificate signature contract
//! checked over randomly generated inputs.

use aergo_p2p::cert::{check_and_get_v1_at, AgentCertificate, CERT_TTL};
use aergo_p2p::waiting::{backoff_delay, WaitingPeerManager, BACKOFF_SLOTS};
use aergo_p2p::{Message, MessageCodec, MsgId, NetAddr, PeerId, PeerMeta, SubProtocol};
use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use secp256k1::SecretKey;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

fn arb_id_16() -> impl Strategy<Value = [u8; 16]> {
    prop::array::uniform16(any::<u8>())
}

fn arb_id_32() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

prop_compose! {
    fn arb_message()(
        sub in any::<u32>(),
        timestamp in any::<i64>(),
        id in arb_id_16(),
        original in arb_id_16(),
        payload in prop::collection::vec(any::<u8>(), 0..4096),
    ) -> Message {
        Message {
            subprotocol: SubProtocol(sub),
            timestamp,
            id: MsgId::from_bytes(id),
            original_id: MsgId::from_bytes(original),
            payload: Bytes::from(payload),
        }
    }
}

fn arb_secret() -> impl Strategy<Value = SecretKey> {
    arb_id_32().prop_filter_map("not a valid secret key", |b| SecretKey::from_slice(&b).ok())
}

proptest! {
    #[test]
    fn framing_roundtrip(msgs in prop::collection::vec(arb_message(), 1..8)) {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        for msg in &msgs {
            codec.encode(msg.clone(), &mut buf).unwrap();
        }
        let mut decoded = Vec::new();
        while let Some(msg) = codec.decode(&mut buf).unwrap() {
            decoded.push(msg);
        }
        prop_assert_eq!(decoded, msgs);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn framing_waits_for_whole_frame(msg in arb_message(), cut in 0usize..64) {
        let mut codec = MessageCodec::new();
        let mut full = BytesMut::new();
        codec.encode(msg.clone(), &mut full).unwrap();
        let split = cut.min(full.len() - 1);

        let mut partial = BytesMut::from(&full[..split]);
        prop_assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[split..]);
        prop_assert_eq!(codec.decode(&mut partial).unwrap(), Some(msg));
    }

    #[test]
    fn oversize_payload_rejected(extra in 1usize..1024) {
        let mut codec = MessageCodec::with_max_size(1024);
        let msg = Message::new(SubProtocol::PING_REQUEST, Bytes::from(vec![0u8; 1024 + extra]));
        let mut buf = BytesMut::new();
        prop_assert!(codec.encode(msg, &mut buf).is_err());
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn backoff_is_monotonic(trial in 0u32..64) {
        prop_assert!(backoff_delay(trial + 1) >= backoff_delay(trial));
        if trial >= BACKOFF_SLOTS - 1 {
            prop_assert_eq!(backoff_delay(trial), backoff_delay(BACKOFF_SLOTS - 1));
        }
    }

    #[test]
    fn designated_retry_gaps_never_shrink(failures in 1usize..40) {
        let start = Instant::now();
        let mut wm = WaitingPeerManager::new(PeerId::from_bytes([0; 32]), false, 10);
        let mut meta = PeerMeta::with_id(PeerId::from_bytes([1; 32]));
        meta.addresses = vec![NetAddr::new("10.1.1.1", 7846)];
        meta.designated = true;
        wm.on_peer_disconnect(&meta, start);

        let mut now = wm.get(&meta.id).unwrap().next_trial;
        let mut last = Duration::ZERO;
        for _ in 0..failures {
            prop_assert_eq!(wm.next_dials(now, 0).len(), 1);
            wm.on_work_done(&meta.id, Err("refused".into()), now);
            let next = wm.get(&meta.id).unwrap().next_trial;
            prop_assert!(next - now >= last);
            last = next - now;
            now = next;
        }
    }

    #[test]
    fn issued_certificate_verifies(
        bp_key in arb_secret(),
        agent in arb_id_32(),
        create in 0i64..(1i64 << 62),
    ) {
        let cert = AgentCertificate::new_v1_at(
            &bp_key,
            PeerId::from_bytes(agent),
            vec!["10.0.0.1".to_string()],
            CERT_TTL,
            create,
        ).unwrap();
        prop_assert!(cert.verify());
        let parsed = check_and_get_v1_at(&cert.to_raw(), create).unwrap();
        prop_assert_eq!(parsed, cert);
    }

    #[test]
    fn mutated_certificate_fails(
        bp_key in arb_secret(),
        agent in arb_id_32(),
        other in arb_id_32(),
        field in 0usize..4,
        delta in 1i64..1_000_000,
    ) {
        let mut cert = AgentCertificate::new_v1_at(
            &bp_key,
            PeerId::from_bytes(agent),
            vec!["10.0.0.1".to_string()],
            CERT_TTL,
            1_000_000_000,
        ).unwrap();
        match field {
            0 => cert.create_time += delta,
            1 => cert.expire_time -= delta,
            2 => {
                prop_assume!(other != agent);
                cert.agent_id = PeerId::from_bytes(other);
            }
            _ => cert.agent_addresses.push(format!("10.0.0.{}", delta % 250)),
        }
        prop_assert!(!cert.verify());
    }
}
