//! Minimal authenticated transport.
//!
//! Before the wire handshake both sides prove ownership of their node
//! key:
//!
//! ```text
//! -> pubkey (33 bytes, compressed) | nonce (32 bytes)
//! <- pubkey (33 bytes, compressed) | nonce (32 bytes)
//! -> sig_len (2 bytes) | DER signature over SHA-256(domain | peer nonce | own pubkey)
//! <- sig_len (2 bytes) | DER signature
//! ```
//!
//! The remote [`PeerId`] is derived from the verified public key. The
//! stream itself is not encrypted.

use crate::codec::BoxStream;
use crate::key::{verify_digest, NodeKey};
use crate::types::{ConnectionInfo, NetAddr, PeerId};
use crate::{NetworkError, NetworkResult};
use rand::RngCore;
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

const AUTH_DOMAIN: &[u8] = b"aergo-p2p-auth";
const PUBKEY_SIZE: usize = 33;
const NONCE_SIZE: usize = 32;
const MAX_DER_SIG_SIZE: usize = 72;

/// Deadline for connecting and authenticating.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

fn auth_digest(peer_nonce: &[u8], own_pubkey: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(AUTH_DOMAIN);
    h.update(peer_nonce);
    h.update(own_pubkey);
    h.finalize().into()
}

/// Exchange and verify node keys on a fresh stream.
///
/// Returns the remote peer id. When `expected` is given, a different
/// remote identity is an error.
pub async fn authenticate<S>(
    stream: &mut S,
    key: &NodeKey,
    expected: Option<PeerId>,
) -> NetworkResult<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let own_pubkey = key.public().serialize();
    let mut own_nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut own_nonce);

    let mut hello = Vec::with_capacity(PUBKEY_SIZE + NONCE_SIZE);
    hello.extend_from_slice(&own_pubkey);
    hello.extend_from_slice(&own_nonce);
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut remote_hello = [0u8; PUBKEY_SIZE + NONCE_SIZE];
    stream.read_exact(&mut remote_hello).await?;
    let (remote_pubkey_raw, remote_nonce) = remote_hello.split_at(PUBKEY_SIZE);
    let remote_pubkey = PublicKey::from_slice(remote_pubkey_raw)
        .map_err(|e| NetworkError::HandshakeFailed(format!("invalid remote key: {}", e)))?;
    let remote_id = PeerId::from_public_key(&remote_pubkey);
    if let Some(expected) = expected {
        if expected != remote_id {
            return Err(NetworkError::HandshakeFailed(format!(
                "expected peer {} but got {}",
                expected, remote_id
            )));
        }
    }
    if remote_id == key.id() {
        return Err(NetworkError::HandshakeFailed("connected to self".into()));
    }

    let sig = key.sign_digest(&auth_digest(remote_nonce, &own_pubkey))?;
    let der = sig.serialize_der();
    let mut proof = Vec::with_capacity(2 + der.len());
    proof.extend_from_slice(&(der.len() as u16).to_be_bytes());
    proof.extend_from_slice(&der);
    stream.write_all(&proof).await?;
    stream.flush().await?;

    let sig_len = stream.read_u16().await? as usize;
    if sig_len == 0 || sig_len > MAX_DER_SIG_SIZE {
        return Err(NetworkError::HandshakeFailed(format!(
            "invalid signature length {}",
            sig_len
        )));
    }
    let mut sig_raw = vec![0u8; sig_len];
    stream.read_exact(&mut sig_raw).await?;
    let remote_sig = Signature::from_der(&sig_raw)
        .map_err(|e| NetworkError::HandshakeFailed(format!("invalid signature: {}", e)))?;
    if !verify_digest(
        &remote_pubkey,
        &auth_digest(&own_nonce, remote_pubkey_raw),
        &remote_sig,
    ) {
        return Err(NetworkError::HandshakeFailed(
            "remote key proof failed".into(),
        ));
    }

    debug!(peer = %remote_id.short(), "Transport authenticated");
    Ok(remote_id)
}

/// Connect to `addr` and authenticate the remote as `expected`.
pub async fn dial(
    addr: &NetAddr,
    key: &NodeKey,
    expected: PeerId,
) -> NetworkResult<(BoxStream, ConnectionInfo)> {
    let fut = async {
        let mut stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        authenticate(&mut stream, key, Some(expected)).await?;
        Ok::<_, NetworkError>(stream)
    };
    let stream = tokio::time::timeout(DIAL_TIMEOUT, fut)
        .await
        .map_err(|_| NetworkError::Timeout(format!("dial {}", addr)))??;
    let info = ConnectionInfo {
        remote: addr.clone(),
        outbound: true,
    };
    Ok((Box::new(stream), info))
}

/// Authenticate an accepted TCP connection.
pub async fn accept(
    mut stream: TcpStream,
    key: &NodeKey,
) -> NetworkResult<(BoxStream, PeerId, ConnectionInfo)> {
    let remote = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let remote_id = tokio::time::timeout(DIAL_TIMEOUT, authenticate(&mut stream, key, None))
        .await
        .map_err(|_| NetworkError::Timeout(format!("authenticate {}", remote)))??;
    let info = ConnectionInfo {
        remote: NetAddr::new(remote.ip().to_string(), remote.port()),
        outbound: false,
    };
    Ok((Box::new(stream), remote_id, info))
}

/// Bind the P2P listener.
pub async fn listen(bind: &NetAddr) -> NetworkResult<TcpListener> {
    let listener = TcpListener::bind((bind.host.as_str(), bind.port)).await?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutual_authentication() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let ka = NodeKey::generate();
        let kb = NodeKey::generate();
        let (ida, idb) = (ka.id(), kb.id());

        let left = tokio::spawn(async move { authenticate(&mut a, &ka, Some(idb)).await });
        let right = tokio::spawn(async move { authenticate(&mut b, &kb, None).await });
        assert_eq!(left.await.unwrap().unwrap(), idb);
        assert_eq!(right.await.unwrap().unwrap(), ida);
    }

    #[tokio::test]
    async fn test_unexpected_identity_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let ka = NodeKey::generate();
        let kb = NodeKey::generate();
        let wrong = NodeKey::generate().id();

        let left = tokio::spawn(async move { authenticate(&mut a, &ka, Some(wrong)).await });
        let right = tokio::spawn(async move { authenticate(&mut b, &kb, None).await });
        assert!(left.await.unwrap().is_err());
        // the other side sees the stream close before the proof arrives
        assert!(right.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_tcp_dial_and_accept() {
        let server_key = NodeKey::generate();
        let server_id = server_key.id();
        let listener = listen(&NetAddr::new("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, &server_key).await.map(|(_, id, info)| (id, info))
        });

        let client_key = NodeKey::generate();
        let (_, info) = dial(&NetAddr::new("127.0.0.1", port), &client_key, server_id)
            .await
            .unwrap();
        assert!(info.outbound);
        let (id, info) = server.await.unwrap().unwrap();
        assert_eq!(id, client_key.id());
        assert!(!info.outbound);
    }
}
