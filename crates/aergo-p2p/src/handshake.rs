//! Aergo P2P handshake protocol.
//!
//! The handshake runs in two stages on a freshly authenticated stream.
//!
//! The wire stage is sent as raw bytes (no framing) and picks the
//! protocol version:
//! - outbound: magic (4) | count (4) | versions (4 each, newest first)
//! - inbound:  magic (4) | response code (4)
//!
//! The response code is the chosen version, or an error code when the
//! magic is [`HS_ERROR`].
//!
//! The inner stage exchanges framed `Status` messages whose checks
//! depend on the chosen version. A side that rejects the remote status
//! sends a `GoAway` with the reason before closing.

use crate::actor::ChainAccessor;
use crate::cert::{check_and_get_v1, AgentCertificate, CertificateManager};
use crate::codec::{framed, BoxStream, Message, MsgFramed};
use crate::message::{GoAwayNotice, Status, SubProtocol};
use crate::types::{BlockId, PeerId, PeerMeta, PeerRole};
use crate::wire::Payload;
use crate::{NetworkError, NetworkResult, NODE_VERSION};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Magic of a rejected wire handshake.
pub const HS_ERROR: u32 = 0xFFFF_FFFF;

/// The request was malformed or used a wrong magic.
pub const HS_CODE_WRONG_HS_REQ: u32 = 1;

/// No version is supported by both sides.
pub const HS_CODE_NO_MATCHED_VERSION: u32 = 2;

/// Upper bound of versions accepted in one request.
pub const HS_MAX_VERSION_CNT: usize = 16;

/// Deadline of the whole handshake.
pub const DEFAULT_HANDSHAKE_TTL: Duration = Duration::from_secs(20);

/// Protocol version negotiated by the wire stage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct P2PVersion(pub u32);

impl P2PVersion {
    pub const V030: P2PVersion = P2PVersion(0x0000_0030);
    pub const V031: P2PVersion = P2PVersion(0x0000_0031);
    pub const V032: P2PVersion = P2PVersion(0x0000_0032);
    pub const V033: P2PVersion = P2PVersion(0x0000_0033);
    pub const V200: P2PVersion = P2PVersion(0x0000_0200);

    /// Versions this implementation speaks, newest first.
    pub const ALL: [P2PVersion; 5] = [
        Self::V200,
        Self::V033,
        Self::V032,
        Self::V031,
        Self::V030,
    ];

    fn checks_genesis(self) -> bool {
        self >= Self::V032
    }

    fn chain_id_by_remote_height(self) -> bool {
        self >= Self::V033
    }

    fn checks_role(self) -> bool {
        self >= Self::V200
    }
}

impl fmt::Display for P2PVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::V030 => f.write_str("v0.3.0"),
            Self::V031 => f.write_str("v0.3.1"),
            Self::V032 => f.write_str("v0.3.2"),
            Self::V033 => f.write_str("v0.3.3"),
            Self::V200 => f.write_str("v2.0.0"),
            other => write!(f, "unknown({:#x})", other.0),
        }
    }
}

impl fmt::Debug for P2PVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Outcome of a successful handshake, consumed by the peer manager.
pub struct HandshakeResult {
    pub meta: PeerMeta,
    pub best_hash: BlockId,
    pub best_no: u64,
    pub certificates: Vec<AgentCertificate>,
    pub hidden: bool,
    pub version: P2PVersion,
    pub framed: MsgFramed,
}

impl fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeResult")
            .field("peer", &self.meta.id)
            .field("version", &self.version)
            .field("best_no", &self.best_no)
            .field("certificates", &self.certificates.len())
            .finish()
    }
}

/// A remote status that failed the inner handshake.
struct Rejection {
    reason: &'static str,
    error: NetworkError,
}

impl Rejection {
    fn new(reason: &'static str, error: NetworkError) -> Self {
        Self { reason, error }
    }
}

/// Runs both handshake stages for inbound and outbound sessions.
pub struct Handshaker {
    magic: u32,
    versions: Vec<P2PVersion>,
    self_meta: PeerMeta,
    chain: Arc<dyn ChainAccessor>,
    certs: Arc<dyn CertificateManager>,
    ttl: Duration,
}

impl Handshaker {
    pub fn new(
        magic: u32,
        self_meta: PeerMeta,
        chain: Arc<dyn ChainAccessor>,
        certs: Arc<dyn CertificateManager>,
    ) -> Self {
        Self {
            magic,
            versions: P2PVersion::ALL.to_vec(),
            self_meta,
            chain,
            certs,
            ttl: DEFAULT_HANDSHAKE_TTL,
        }
    }

    /// Restrict the supported versions (newest first).
    pub fn with_versions(mut self, versions: Vec<P2PVersion>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn self_meta(&self) -> &PeerMeta {
        &self.self_meta
    }

    /// Handshake as the dialing side. `remote_id` is the authenticated transport identity.
    pub async fn outbound(
        &self,
        stream: BoxStream,
        remote_id: PeerId,
    ) -> NetworkResult<HandshakeResult> {
        tokio::time::timeout(self.ttl, self.do_outbound(stream, remote_id))
            .await
            .map_err(|_| NetworkError::Timeout(format!("handshake with {}", remote_id.short())))?
    }

    /// Handshake as the accepting side.
    pub async fn inbound(
        &self,
        stream: BoxStream,
        remote_id: PeerId,
    ) -> NetworkResult<HandshakeResult> {
        tokio::time::timeout(self.ttl, self.do_inbound(stream, remote_id))
            .await
            .map_err(|_| NetworkError::Timeout(format!("handshake with {}", remote_id.short())))?
    }

    async fn do_outbound(
        &self,
        mut stream: BoxStream,
        remote_id: PeerId,
    ) -> NetworkResult<HandshakeResult> {
        let mut req = Vec::with_capacity(8 + 4 * self.versions.len());
        req.extend_from_slice(&self.magic.to_be_bytes());
        req.extend_from_slice(&(self.versions.len() as u32).to_be_bytes());
        for v in &self.versions {
            req.extend_from_slice(&v.0.to_be_bytes());
        }
        stream.write_all(&req).await?;
        stream.flush().await?;

        let magic = stream.read_u32().await?;
        let code = stream.read_u32().await?;
        if magic != self.magic {
            return Err(match (magic, code) {
                (HS_ERROR, HS_CODE_NO_MATCHED_VERSION) => NetworkError::NoMatchedVersion,
                (HS_ERROR, code) => {
                    NetworkError::HandshakeFailed(format!("remote rejected request: code {}", code))
                }
                (other, _) => NetworkError::WrongMagic(other),
            });
        }
        let version = P2PVersion(code);
        if !self.versions.contains(&version) {
            return Err(NetworkError::NoMatchedVersion);
        }
        debug!(peer = %remote_id.short(), %version, "Wire handshake done");

        let mut framed = framed(stream);
        let local = self.local_status(version)?;
        send_message(&mut framed, SubProtocol::STATUS_REQUEST, &local).await?;
        let remote = receive_status(&mut framed).await?;
        self.finish(framed, version, remote, remote_id).await
    }

    async fn do_inbound(
        &self,
        mut stream: BoxStream,
        remote_id: PeerId,
    ) -> NetworkResult<HandshakeResult> {
        let (magic, offered) = match read_request(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                if let Err(reply) = write_response(&mut stream, HS_ERROR, HS_CODE_WRONG_HS_REQ).await {
                    debug!(peer = %remote_id.short(), error = %reply, "Failed to reject handshake request");
                }
                return Err(e);
            }
        };
        if magic != self.magic {
            write_response(&mut stream, HS_ERROR, HS_CODE_WRONG_HS_REQ).await?;
            return Err(NetworkError::WrongMagic(magic));
        }

        let version = match self.versions.iter().find(|v| offered.contains(v)) {
            Some(v) => *v,
            None => {
                write_response(&mut stream, HS_ERROR, HS_CODE_NO_MATCHED_VERSION).await?;
                debug!(peer = %remote_id.short(), ?offered, "No matched p2p version");
                return Err(NetworkError::NoMatchedVersion);
            }
        };
        write_response(&mut stream, self.magic, version.0).await?;
        debug!(peer = %remote_id.short(), %version, "Wire handshake done");

        let mut framed = framed(stream);
        let remote = receive_status(&mut framed).await?;
        let result = self.finish(framed, version, remote, remote_id).await?;
        let mut framed = result.framed;
        let local = self.local_status(version)?;
        send_message(&mut framed, SubProtocol::STATUS_REQUEST, &local).await?;
        Ok(HandshakeResult { framed, ..result })
    }

    async fn finish(
        &self,
        mut framed: MsgFramed,
        version: P2PVersion,
        remote: Status,
        remote_id: PeerId,
    ) -> NetworkResult<HandshakeResult> {
        match self.check_remote_status(version, &remote, remote_id) {
            Ok((meta, certificates)) => {
                info!(
                    peer = %remote_id.short(),
                    %version,
                    role = %meta.role,
                    best_no = remote.best_height,
                    "Handshake complete"
                );
                Ok(HandshakeResult {
                    meta,
                    best_hash: remote.best_block_hash,
                    best_no: remote.best_height,
                    certificates,
                    hidden: remote.no_expose,
                    version,
                    framed,
                })
            }
            Err(rejection) => {
                send_go_away(&mut framed, rejection.reason).await;
                Err(rejection.error)
            }
        }
    }

    fn local_status(&self, version: P2PVersion) -> NetworkResult<Status> {
        let best = self.chain.best_block()?;
        let certificates = if version.checks_role() && self.self_meta.role == PeerRole::Agent {
            self.certs
                .get_certificates()
                .iter()
                .map(|c| c.to_raw())
                .collect()
        } else {
            Vec::new()
        };
        Ok(Status {
            chain_id: self.chain.chain_id(best.block_no()),
            best_block_hash: best.hash,
            best_height: best.block_no(),
            sender: Some(self.self_meta.to_peer_address()),
            no_expose: self.self_meta.hidden,
            version: NODE_VERSION.to_string(),
            genesis: version.checks_genesis().then(|| self.chain.genesis_hash()),
            certificates,
        })
    }

    fn check_remote_status(
        &self,
        version: P2PVersion,
        status: &Status,
        remote_id: PeerId,
    ) -> Result<(PeerMeta, Vec<AgentCertificate>), Rejection> {
        let local_chain_id = if version.chain_id_by_remote_height() {
            self.chain.chain_id(status.best_height)
        } else {
            let best = self
                .chain
                .best_block()
                .map_err(|e| Rejection::new("internal error", e))?;
            self.chain.chain_id(best.block_no())
        };
        if local_chain_id != status.chain_id {
            return Err(Rejection::new(
                "different chainID",
                NetworkError::HandshakeFailed("different chain id".into()),
            ));
        }

        let sender = status.sender.as_ref().ok_or_else(|| {
            Rejection::new(
                "invalid peer address",
                NetworkError::HandshakeFailed("missing sender".into()),
            )
        })?;
        let mut meta = PeerMeta::from_peer_address(sender);
        if meta.primary_addr().is_none() {
            return Err(Rejection::new(
                "invalid peer address",
                NetworkError::HandshakeFailed("sender has no dialable address".into()),
            ));
        }
        if meta.id != remote_id {
            return Err(Rejection::new(
                "Inconsistent peerID",
                NetworkError::HandshakeFailed(format!(
                    "sender {} is not transport peer {}",
                    meta.id.short(),
                    remote_id.short()
                )),
            ));
        }
        meta.version = status.version.clone();
        meta.hidden = status.no_expose;

        if version.checks_genesis() && status.genesis != Some(self.chain.genesis_hash()) {
            return Err(Rejection::new(
                "different genesis block",
                NetworkError::HandshakeFailed("different genesis block".into()),
            ));
        }

        let certificates = if version.checks_role() {
            check_by_role(&meta, status).map_err(|e| {
                Rejection::new("invalid certificate works", e)
            })?
        } else {
            if meta.role == PeerRole::Agent {
                // agents need certificates, which older versions cannot carry
                meta.role = PeerRole::Watcher;
            }
            Vec::new()
        };
        Ok((meta, certificates))
    }
}

/// Agents must name their producers and present only certificates
/// issued to themselves by those producers.
fn check_by_role(meta: &PeerMeta, status: &Status) -> NetworkResult<Vec<AgentCertificate>> {
    if meta.role != PeerRole::Agent {
        return Ok(Vec::new());
    }
    if meta.producer_ids.is_empty() {
        return Err(NetworkError::InvalidCertificate(
            "agent without producers".into(),
        ));
    }
    let mut certs = Vec::with_capacity(status.certificates.len());
    for raw in &status.certificates {
        let cert = check_and_get_v1(raw)?;
        if cert.agent_id != meta.id {
            return Err(NetworkError::InvalidCertificate(
                "certificate is not for this agent".into(),
            ));
        }
        if !meta.producer_ids.contains(&cert.bp_id) {
            return Err(NetworkError::InvalidCertificate(format!(
                "certificate issuer {} is not a producer of the agent",
                cert.bp_id.short()
            )));
        }
        certs.push(cert);
    }
    Ok(certs)
}

/// Read the outbound side's magic and offered versions.
async fn read_request(stream: &mut BoxStream) -> NetworkResult<(u32, Vec<P2PVersion>)> {
    let magic = stream.read_u32().await?;
    let count = stream.read_u32().await? as usize;
    if count == 0 || count > HS_MAX_VERSION_CNT {
        return Err(NetworkError::HandshakeFailed(format!(
            "invalid version count {}",
            count
        )));
    }
    let mut offered = Vec::with_capacity(count);
    for _ in 0..count {
        offered.push(P2PVersion(stream.read_u32().await?));
    }
    Ok((magic, offered))
}

async fn write_response(stream: &mut BoxStream, magic: u32, code: u32) -> NetworkResult<()> {
    let mut resp = [0u8; 8];
    resp[..4].copy_from_slice(&magic.to_be_bytes());
    resp[4..].copy_from_slice(&code.to_be_bytes());
    stream.write_all(&resp).await?;
    stream.flush().await?;
    Ok(())
}

async fn send_message<P: Payload>(
    framed: &mut MsgFramed,
    subprotocol: SubProtocol,
    body: &P,
) -> NetworkResult<()> {
    let msg = Message::new(subprotocol, body.encode()?);
    framed.send(msg).await
}

async fn send_go_away(framed: &mut MsgFramed, reason: &str) {
    let notice = GoAwayNotice {
        message: reason.to_string(),
    };
    if let Err(e) = send_message(framed, SubProtocol::GO_AWAY, &notice).await {
        debug!(error = %e, "Failed to send go away");
    }
}

async fn receive_status(framed: &mut MsgFramed) -> NetworkResult<Status> {
    let msg = match framed.next().await {
        Some(Ok(msg)) => msg,
        Some(Err(e)) => {
            send_go_away(framed, "malformed message").await;
            return Err(e);
        }
        None => return Err(NetworkError::ConnectionClosed),
    };
    match msg.subprotocol {
        SubProtocol::STATUS_REQUEST => match Status::decode(&msg.payload) {
            Ok(status) => Ok(status),
            Err(e) => {
                send_go_away(framed, "malformed status message").await;
                Err(e)
            }
        },
        SubProtocol::GO_AWAY => {
            let notice = GoAwayNotice::decode(&msg.payload)?;
            Err(NetworkError::GoAway(notice.message))
        }
        other => {
            send_go_away(framed, "unexpected message type").await;
            Err(NetworkError::HandshakeFailed(format!(
                "unexpected message {} during handshake",
                other
            )))
        }
    }
}
