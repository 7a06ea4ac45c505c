//! Agent certificates.
//!
//! A block producer authorizes an agent node to speak for it by signing
//! a short-lived certificate naming the agent's peer id and addresses.
//! The certificate manager is chosen by the local role:
//!
//! - producer: issues certificates
//! - agent: stores certificates, requests renewals and drops expired ones
//! - watcher: neither

use crate::service::P2PCommand;
use crate::types::{now_unix_nanos, PeerId, PeerMeta, PeerRole};
use crate::wire::{get_bytes, get_i64, get_list, get_u32, put_bytes, put_list, Payload};
use crate::{NetworkError, NetworkResult};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message as SecpMessage, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Only certificate format in use.
pub const CERT_VERSION_0001: u32 = 0x01;

/// Lifetime of an issued certificate.
pub const CERT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Clock skew tolerated when checking validity.
pub const TIME_ERROR_TOLERANCE: Duration = Duration::from_secs(60);

/// Certificates with less remaining lifetime than this are renewed.
pub const DEFAULT_EXPIRE_BUF_TERM: Duration = Duration::from_secs(12 * 60 * 60);

/// Interval of the agent's certificate sweep.
pub const CERT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Certificate as carried on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawCertificate {
    pub version: u32,
    pub bp_id: Bytes,
    pub bp_pub_key: Bytes,
    pub create_time: i64,
    pub expire_time: i64,
    pub agent_id: Bytes,
    pub agent_addresses: Vec<String>,
    pub signature: Bytes,
}

impl Payload for RawCertificate {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
        put_bytes(buf, &self.bp_id);
        put_bytes(buf, &self.bp_pub_key);
        buf.put_i64(self.create_time);
        buf.put_i64(self.expire_time);
        put_bytes(buf, &self.agent_id);
        put_list(buf, &self.agent_addresses);
        put_bytes(buf, &self.signature);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            version: get_u32(buf)?,
            bp_id: get_bytes(buf)?,
            bp_pub_key: get_bytes(buf)?,
            create_time: get_i64(buf)?,
            expire_time: get_i64(buf)?,
            agent_id: get_bytes(buf)?,
            agent_addresses: get_list(buf)?,
            signature: get_bytes(buf)?,
        })
    }
}

/// A validated certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCertificate {
    pub version: u32,
    pub bp_id: PeerId,
    pub bp_pub_key: PublicKey,
    /// Unix nanoseconds.
    pub create_time: i64,
    /// Unix nanoseconds.
    pub expire_time: i64,
    pub agent_id: PeerId,
    pub agent_addresses: Vec<String>,
    pub signature: Signature,
}

fn nanos(d: Duration) -> i64 {
    d.as_nanos() as i64
}

/// SHA-256 over the little-endian encoding of every field but the signature.
fn certificate_digest(
    version: u32,
    bp_id: &PeerId,
    bp_pub_key: &PublicKey,
    create_time: i64,
    expire_time: i64,
    agent_id: &PeerId,
    agent_addresses: &[String],
) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(version.to_le_bytes());
    h.update(bp_id.as_bytes());
    h.update(bp_pub_key.serialize());
    h.update(create_time.to_le_bytes());
    h.update(expire_time.to_le_bytes());
    h.update(agent_id.as_bytes());
    for addr in agent_addresses {
        h.update(addr.as_bytes());
    }
    h.finalize().into()
}

impl AgentCertificate {
    /// Issue a certificate for `agent_id` signed with the producer key.
    pub fn new_v1(
        bp_key: &SecretKey,
        agent_id: PeerId,
        agent_addresses: Vec<String>,
        ttl: Duration,
    ) -> NetworkResult<Self> {
        Self::new_v1_at(bp_key, agent_id, agent_addresses, ttl, now_unix_nanos())
    }

    /// Issue a certificate with an explicit creation time.
    pub fn new_v1_at(
        bp_key: &SecretKey,
        agent_id: PeerId,
        agent_addresses: Vec<String>,
        ttl: Duration,
        create_time: i64,
    ) -> NetworkResult<Self> {
        if agent_addresses.is_empty() {
            return Err(NetworkError::InvalidCertificate(
                "agent has no address".into(),
            ));
        }
        let bp_pub_key = bp_key.public_key(SECP256K1);
        let bp_id = PeerId::from_public_key(&bp_pub_key);
        let expire_time = create_time + nanos(ttl);
        let digest = certificate_digest(
            CERT_VERSION_0001,
            &bp_id,
            &bp_pub_key,
            create_time,
            expire_time,
            &agent_id,
            &agent_addresses,
        );
        let signature = SECP256K1.sign_ecdsa(&SecpMessage::from_digest_slice(&digest)?, bp_key);
        Ok(Self {
            version: CERT_VERSION_0001,
            bp_id,
            bp_pub_key,
            create_time,
            expire_time,
            agent_id,
            agent_addresses,
            signature,
        })
    }

    pub fn digest(&self) -> [u8; 32] {
        certificate_digest(
            self.version,
            &self.bp_id,
            &self.bp_pub_key,
            self.create_time,
            self.expire_time,
            &self.agent_id,
            &self.agent_addresses,
        )
    }

    /// Check the producer's signature.
    pub fn verify(&self) -> bool {
        match SecpMessage::from_digest_slice(&self.digest()) {
            Ok(msg) => SECP256K1
                .verify_ecdsa(&msg, &self.signature, &self.bp_pub_key)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Whether `now` falls in the validity window, widened by `tolerance`.
    pub fn is_valid_in_time(&self, now: i64, tolerance: Duration) -> bool {
        let tol = nanos(tolerance);
        self.create_time <= now + tol && now - tol <= self.expire_time
    }

    /// Whether less than `buf_term` of the lifetime remains.
    pub fn is_need_update(&self, now: i64, buf_term: Duration) -> bool {
        self.expire_time < now + nanos(buf_term)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_time < now
    }

    pub fn to_raw(&self) -> RawCertificate {
        RawCertificate {
            version: self.version,
            bp_id: Bytes::copy_from_slice(self.bp_id.as_bytes()),
            bp_pub_key: Bytes::copy_from_slice(&self.bp_pub_key.serialize()),
            create_time: self.create_time,
            expire_time: self.expire_time,
            agent_id: Bytes::copy_from_slice(self.agent_id.as_bytes()),
            agent_addresses: self.agent_addresses.clone(),
            signature: Bytes::from(self.signature.serialize_der().to_vec()),
        }
    }
}

/// Validate a received certificate of any known version.
pub fn check_raw_cert(raw: &RawCertificate) -> NetworkResult<AgentCertificate> {
    match raw.version {
        CERT_VERSION_0001 => check_and_get_v1(raw),
        v => Err(NetworkError::InvalidCertificate(format!(
            "unknown certificate version {}",
            v
        ))),
    }
}

/// Validate a version 1 certificate against the current time.
pub fn check_and_get_v1(raw: &RawCertificate) -> NetworkResult<AgentCertificate> {
    check_and_get_v1_at(raw, now_unix_nanos())
}

/// Validate a version 1 certificate.
///
/// The producer id must derive from the embedded public key, `now` must
/// fall in the validity window and the signature must verify.
pub fn check_and_get_v1_at(raw: &RawCertificate, now: i64) -> NetworkResult<AgentCertificate> {
    let invalid = |m: &str| NetworkError::InvalidCertificate(m.to_string());

    let bp_id = PeerId::from_slice(&raw.bp_id).map_err(|_| invalid("invalid producer id"))?;
    let bp_pub_key =
        PublicKey::from_slice(&raw.bp_pub_key).map_err(|_| invalid("invalid producer key"))?;
    if PeerId::from_public_key(&bp_pub_key) != bp_id {
        return Err(invalid("producer id does not match key"));
    }
    let agent_id = PeerId::from_slice(&raw.agent_id).map_err(|_| invalid("invalid agent id"))?;
    if raw.agent_addresses.is_empty() || raw.agent_addresses.iter().any(|a| a.is_empty()) {
        return Err(invalid("invalid agent address"));
    }
    let signature = Signature::from_der(&raw.signature).map_err(|_| invalid("invalid signature"))?;

    let cert = AgentCertificate {
        version: raw.version,
        bp_id,
        bp_pub_key,
        create_time: raw.create_time,
        expire_time: raw.expire_time,
        agent_id,
        agent_addresses: raw.agent_addresses.clone(),
        signature,
    };
    if !cert.is_valid_in_time(now, TIME_ERROR_TOLERANCE) {
        return Err(invalid("certificate is not valid at this time"));
    }
    if !cert.verify() {
        return Err(invalid("signature verification failed"));
    }
    Ok(cert)
}

/// Role-dependent certificate handling.
pub trait CertificateManager: Send + Sync {
    /// Issue a certificate for a remote agent. Only producers can.
    fn create_certificate(&self, remote: &PeerMeta) -> NetworkResult<AgentCertificate> {
        let _ = remote;
        Err(NetworkError::InvalidRole)
    }

    /// Producers this node represents.
    fn get_producers(&self) -> Vec<PeerId> {
        Vec::new()
    }

    /// Certificates held by this node that are not expired.
    fn get_certificates(&self) -> Vec<AgentCertificate> {
        Vec::new()
    }

    fn add_certificate(&self, cert: AgentCertificate) {
        let _ = cert;
    }

    fn on_peer_connect(&self, id: PeerId) {
        let _ = id;
    }

    fn on_peer_disconnect(&self, id: PeerId) {
        let _ = id;
    }

    /// Periodic maintenance at `now` (unix nanos).
    fn sweep(&self, now: i64) {
        let _ = now;
    }
}

/// Build the certificate manager for the local role.
pub fn new_certificate_manager(
    self_meta: PeerMeta,
    key: SecretKey,
    commands: mpsc::Sender<P2PCommand>,
) -> Arc<dyn CertificateManager> {
    match self_meta.role {
        PeerRole::Producer => Arc::new(BpCertificateManager { self_meta, key }),
        PeerRole::Agent => Arc::new(AgentCertificateManager::new(self_meta, commands)),
        PeerRole::Watcher => Arc::new(WatcherCertificateManager),
    }
}

pub struct BpCertificateManager {
    self_meta: PeerMeta,
    key: SecretKey,
}

impl CertificateManager for BpCertificateManager {
    fn create_certificate(&self, remote: &PeerMeta) -> NetworkResult<AgentCertificate> {
        let addrs = remote.addresses.iter().map(|a| a.host.clone()).collect();
        let cert = AgentCertificate::new_v1(&self.key, remote.id, addrs, CERT_TTL)?;
        debug!(
            bp = %self.self_meta.id.short(),
            agent = %remote.id.short(),
            "Issued agent certificate"
        );
        Ok(cert)
    }
}

pub struct WatcherCertificateManager;

impl CertificateManager for WatcherCertificateManager {}

pub struct AgentCertificateManager {
    self_meta: PeerMeta,
    certs: Mutex<Vec<AgentCertificate>>,
    commands: mpsc::Sender<P2PCommand>,
}

impl AgentCertificateManager {
    pub fn new(self_meta: PeerMeta, commands: mpsc::Sender<P2PCommand>) -> Self {
        Self {
            self_meta,
            certs: Mutex::new(Vec::new()),
            commands,
        }
    }

    fn request_issue(&self, bp_id: PeerId) {
        if let Err(e) = self.commands.try_send(P2PCommand::IssueCertificate { bp_id }) {
            warn!(bp = %bp_id.short(), error = %e, "Failed to request certificate");
        }
    }
}

impl CertificateManager for AgentCertificateManager {
    fn get_producers(&self) -> Vec<PeerId> {
        self.self_meta.producer_ids.clone()
    }

    fn get_certificates(&self) -> Vec<AgentCertificate> {
        let now = now_unix_nanos();
        self.certs
            .lock()
            .iter()
            .filter(|c| !c.is_expired(now))
            .cloned()
            .collect()
    }

    fn add_certificate(&self, cert: AgentCertificate) {
        if !self.self_meta.producer_ids.contains(&cert.bp_id) {
            info!(bp = %cert.bp_id.short(), "Drop issued certificate, issuer is not a managed producer");
            return;
        }
        if cert.agent_id != self.self_meta.id {
            info!(
                bp = %cert.bp_id.short(),
                agent = %cert.agent_id.short(),
                "Drop issued certificate, agent id is not mine"
            );
            return;
        }

        let raw = cert.to_raw();
        {
            let mut certs = self.certs.lock();
            certs.retain(|c| c.bp_id != cert.bp_id);
            info!(
                bp = %cert.bp_id.short(),
                create = cert.create_time,
                expire = cert.expire_time,
                "Issued certificate added"
            );
            certs.push(cert);
        }
        if let Err(e) = self
            .commands
            .try_send(P2PCommand::NotifyCertRenewed { certificate: raw })
        {
            warn!(error = %e, "Failed to announce renewed certificate");
        }
    }

    fn on_peer_connect(&self, id: PeerId) {
        if !self.self_meta.producer_ids.contains(&id) {
            return;
        }
        let now = now_unix_nanos();
        let needs = match self.certs.lock().iter().find(|c| c.bp_id == id) {
            Some(c) => c.is_need_update(now, DEFAULT_EXPIRE_BUF_TERM),
            None => true,
        };
        if needs {
            self.request_issue(id);
        }
    }

    fn sweep(&self, now: i64) {
        let mut renew = Vec::new();
        {
            let mut certs = self.certs.lock();
            certs.retain(|c| {
                if c.is_need_update(now, DEFAULT_EXPIRE_BUF_TERM) {
                    renew.push(c.bp_id);
                }
                !c.is_expired(now)
            });
        }
        renew.truncate(self.self_meta.producer_ids.len());
        for bp_id in renew {
            self.request_issue(bp_id);
        }
    }
}
