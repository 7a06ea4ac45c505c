//! Core identifiers and chain objects exchanged by the P2P layer.

use crate::wire::{
    get_bytes, get_bool, get_i64, get_list, get_string, get_u32, get_u64, get_u8, put_bool,
    put_bytes, put_list, put_string, Payload,
};
use crate::{NetworkError, NetworkResult};
use bytes::{BufMut, Bytes, BytesMut};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix nanoseconds.
pub fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// A 32-byte SHA-256 based identifier of a block or transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

/// Block hash.
pub type BlockId = Hash32;
/// Transaction hash.
pub type TxId = Hash32;

impl Hash32 {
    /// Byte length of the identifier.
    pub const LEN: usize = 32;

    /// Parse from a byte slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> NetworkResult<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            NetworkError::InvalidMessage(format!("Invalid hash length {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// SHA-256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", hex::encode(&self.0[..8]))
    }
}

impl Payload for Hash32 {
    fn write_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.0);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Hash32::from_slice(&get_bytes(buf)?)
    }
}

/// Peer identifier: SHA-256 of the compressed Secp256k1 public key.
///
/// Ordering is lexicographic over the hash bytes and decides which side
/// of a simultaneous connection survives.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the identifier of a public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(Sha256::digest(key.serialize()).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> NetworkResult<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            NetworkError::InvalidMessage(format!("Invalid peer id length {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated form for logs.
    pub fn short(&self) -> String {
        let full = self.to_string();
        full.chars().take(10).collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = bs58::decode(s)
            .into_vec()
            .map_err(|e| NetworkError::InvalidMessage(format!("Invalid peer id {}: {}", s, e)))?;
        Self::from_slice(&raw)
    }
}

impl Payload for PeerId {
    fn write_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.0);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        PeerId::from_slice(&get_bytes(buf)?)
    }
}

/// Role of a node in block production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Block producer.
    Producer,
    /// Observer without block producing authority.
    #[default]
    Watcher,
    /// Public-facing representative of one or more producers.
    Agent,
}

impl PeerRole {
    pub fn as_u8(self) -> u8 {
        match self {
            PeerRole::Producer => 1,
            PeerRole::Watcher => 2,
            PeerRole::Agent => 3,
        }
    }

    /// Legacy peers send 0; anything unknown is treated as a watcher.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PeerRole::Producer,
            3 => PeerRole::Agent,
            _ => PeerRole::Watcher,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerRole::Producer => "producer",
            PeerRole::Watcher => "watcher",
            PeerRole::Agent => "agent",
        };
        f.write_str(s)
    }
}

/// Result status carried by response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultStatus {
    #[default]
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
}

impl ResultStatus {
    pub fn as_u32(self) -> u32 {
        match self {
            ResultStatus::Ok => 0,
            ResultStatus::Canceled => 1,
            ResultStatus::Unknown => 2,
            ResultStatus::InvalidArgument => 3,
            ResultStatus::DeadlineExceeded => 4,
            ResultStatus::NotFound => 5,
            ResultStatus::AlreadyExists => 6,
            ResultStatus::PermissionDenied => 7,
            ResultStatus::ResourceExhausted => 8,
            ResultStatus::FailedPrecondition => 9,
            ResultStatus::Aborted => 10,
            ResultStatus::OutOfRange => 11,
            ResultStatus::Unimplemented => 12,
            ResultStatus::Internal => 13,
            ResultStatus::Unavailable => 14,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => ResultStatus::Ok,
            1 => ResultStatus::Canceled,
            3 => ResultStatus::InvalidArgument,
            4 => ResultStatus::DeadlineExceeded,
            5 => ResultStatus::NotFound,
            6 => ResultStatus::AlreadyExists,
            7 => ResultStatus::PermissionDenied,
            8 => ResultStatus::ResourceExhausted,
            9 => ResultStatus::FailedPrecondition,
            10 => ResultStatus::Aborted,
            11 => ResultStatus::OutOfRange,
            12 => ResultStatus::Unimplemented,
            13 => ResultStatus::Internal,
            14 => ResultStatus::Unavailable,
            _ => ResultStatus::Unknown,
        }
    }
}

impl Payload for ResultStatus {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.as_u32());
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(ResultStatus::from_u32(get_u32(buf)?))
    }
}

/// A dialable endpoint: IP address or DNS name plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetAddr {
    pub host: String,
    pub port: u16,
}

impl NetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// IP address, when the host is a literal address.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Whether the address can be dialed at all.
    pub fn is_dialable(&self) -> bool {
        if self.port == 0 || self.host.is_empty() {
            return false;
        }
        match self.ip() {
            Some(ip) => !ip.is_unspecified() && !ip.is_multicast(),
            None => self
                .host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.'),
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl Payload for NetAddr {
    fn write_to(&self, buf: &mut BytesMut) {
        put_string(buf, &self.host);
        buf.put_u32(self.port as u32);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        let host = get_string(buf)?;
        let port = get_u32(buf)?;
        let port = u16::try_from(port)
            .map_err(|_| NetworkError::InvalidMessage(format!("Invalid port {}", port)))?;
        Ok(Self { host, port })
    }
}

/// Parse a peer multiaddr such as `/ip4/10.0.0.1/tcp/7846/p2p/<base58 id>`.
pub fn parse_multiaddr(s: &str) -> NetworkResult<(NetAddr, PeerId)> {
    let parts: Vec<&str> = s.trim().trim_start_matches('/').split('/').collect();
    if parts.len() != 6 {
        return Err(NetworkError::Config(format!("Invalid multiaddr: {}", s)));
    }
    let host = match parts[0] {
        "ip4" => {
            let ip: std::net::Ipv4Addr = parts[1]
                .parse()
                .map_err(|_| NetworkError::Config(format!("Invalid ip4 in {}", s)))?;
            ip.to_string()
        }
        "ip6" => {
            let ip: std::net::Ipv6Addr = parts[1]
                .parse()
                .map_err(|_| NetworkError::Config(format!("Invalid ip6 in {}", s)))?;
            ip.to_string()
        }
        "dns" | "dns4" | "dns6" => parts[1].to_string(),
        other => {
            return Err(NetworkError::Config(format!(
                "Unsupported address protocol {} in {}",
                other, s
            )))
        }
    };
    if parts[2] != "tcp" || !(parts[4] == "p2p" || parts[4] == "ipfs") {
        return Err(NetworkError::Config(format!("Invalid multiaddr: {}", s)));
    }
    let port: u16 = parts[3]
        .parse()
        .map_err(|_| NetworkError::Config(format!("Invalid port in {}", s)))?;
    let id = PeerId::from_str(parts[5])?;
    Ok((NetAddr::new(host, port), id))
}

/// Render a peer multiaddr.
pub fn to_multiaddr(addr: &NetAddr, id: &PeerId) -> String {
    let proto = match addr.ip() {
        Some(IpAddr::V4(_)) => "ip4",
        Some(IpAddr::V6(_)) => "ip6",
        None => "dns",
    };
    format!("/{}/{}/tcp/{}/p2p/{}", proto, addr.host, addr.port, id)
}

/// Peer description as advertised on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub addresses: Vec<NetAddr>,
    pub role: PeerRole,
    pub version: String,
    pub producer_ids: Vec<PeerId>,
    pub hidden: bool,
}

impl Payload for PeerAddress {
    fn write_to(&self, buf: &mut BytesMut) {
        self.peer_id.write_to(buf);
        put_list(buf, &self.addresses);
        buf.put_u8(self.role.as_u8());
        put_string(buf, &self.version);
        put_list(buf, &self.producer_ids);
        put_bool(buf, self.hidden);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            peer_id: PeerId::read_from(buf)?,
            addresses: get_list(buf)?,
            role: PeerRole::from_u8(get_u8(buf)?),
            version: get_string(buf)?,
            producer_ids: get_list(buf)?,
            hidden: get_bool(buf)?,
        })
    }
}

/// Identity and advertised attributes of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMeta {
    pub id: PeerId,
    pub addresses: Vec<NetAddr>,
    pub role: PeerRole,
    pub producer_ids: Vec<PeerId>,
    pub version: String,
    pub hidden: bool,
    pub designated: bool,
}

impl PeerMeta {
    /// Meta that carries only an identifier.
    pub fn with_id(id: PeerId) -> Self {
        Self {
            id,
            addresses: Vec::new(),
            role: PeerRole::Watcher,
            producer_ids: Vec::new(),
            version: String::new(),
            hidden: false,
            designated: false,
        }
    }

    /// First dialable address, if any.
    pub fn primary_addr(&self) -> Option<&NetAddr> {
        self.addresses.iter().find(|a| a.is_dialable())
    }

    pub fn to_peer_address(&self) -> PeerAddress {
        PeerAddress {
            peer_id: self.id,
            addresses: self.addresses.clone(),
            role: self.role,
            version: self.version.clone(),
            producer_ids: self.producer_ids.clone(),
            hidden: self.hidden,
        }
    }

    pub fn from_peer_address(addr: &PeerAddress) -> Self {
        Self {
            id: addr.peer_id,
            addresses: addr.addresses.clone(),
            role: addr.role,
            producer_ids: addr.producer_ids.clone(),
            version: addr.version.clone(),
            hidden: addr.hidden,
            designated: false,
        }
    }
}

/// Observed transport details of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote: NetAddr,
    pub outbound: bool,
}

/// IP-range classification used by agent fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerZone {
    #[default]
    External,
    Internal,
}

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| NetworkError::Config(format!("Invalid CIDR: {}", s)))?;
        let network: IpAddr = addr
            .parse()
            .map_err(|_| NetworkError::Config(format!("Invalid CIDR address: {}", s)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| NetworkError::Config(format!("Invalid CIDR prefix: {}", s)))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(NetworkError::Config(format!("CIDR prefix too long: {}", s)));
        }
        Ok(Self { network, prefix })
    }
}

/// Zone of a remote address given the configured internal networks.
pub fn classify_zone(ip: Option<IpAddr>, internal: &[Cidr]) -> PeerZone {
    match ip {
        Some(ip) if internal.iter().any(|c| c.contains(&ip)) => PeerZone::Internal,
        _ => PeerZone::External,
    }
}

/// Opaque transaction. The hash commits to the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub hash: TxId,
    pub body: Bytes,
}

impl Tx {
    pub fn new(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            hash: TxId::digest(&body),
            body,
        }
    }
}

impl Payload for Tx {
    fn write_to(&self, buf: &mut BytesMut) {
        self.hash.write_to(buf);
        put_bytes(buf, &self.body);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            hash: TxId::read_from(buf)?,
            body: get_bytes(buf)?,
        })
    }
}

/// Block header fields the P2P layer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub chain_id: Bytes,
    pub prev_block_hash: BlockId,
    pub block_no: u64,
    pub timestamp: i64,
}

impl Payload for BlockHeader {
    fn write_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.chain_id);
        self.prev_block_hash.write_to(buf);
        buf.put_u64(self.block_no);
        buf.put_i64(self.timestamp);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            chain_id: get_bytes(buf)?,
            prev_block_hash: BlockId::read_from(buf)?,
            block_no: get_u64(buf)?,
            timestamp: get_i64(buf)?,
        })
    }
}

/// Block as relayed between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: BlockId,
    pub header: BlockHeader,
    pub txs: Vec<Tx>,
}

impl Block {
    /// Build a block, deriving its hash from the header and tx hashes.
    pub fn new(header: BlockHeader, txs: Vec<Tx>) -> Self {
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        for tx in &txs {
            buf.put_slice(tx.hash.as_bytes());
        }
        Self {
            hash: BlockId::digest(&buf),
            header,
            txs,
        }
    }

    pub fn block_no(&self) -> u64 {
        self.header.block_no
    }

    /// Encoded size, compared against the maximum block size.
    pub fn size(&self) -> usize {
        self.encoded_len()
    }
}

impl Payload for Block {
    fn write_to(&self, buf: &mut BytesMut) {
        self.hash.write_to(buf);
        self.header.write_to(buf);
        put_list(buf, &self.txs);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            hash: BlockId::read_from(buf)?,
            header: BlockHeader::read_from(buf)?,
            txs: get_list(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{SecretKey, SECP256K1};

    fn test_peer_id(seed: u8) -> PeerId {
        let sk = SecretKey::from_slice(&[seed.max(1); 32]).unwrap();
        PeerId::from_public_key(&sk.public_key(SECP256K1))
    }

    #[test]
    fn test_peer_id_base58_roundtrip() {
        let id = test_peer_id(7);
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 10);
    }

    #[test]
    fn test_multiaddr_parse() {
        let id = test_peer_id(3);
        let ma = format!("/ip4/192.168.1.10/tcp/7846/p2p/{}", id);
        let (addr, parsed) = parse_multiaddr(&ma).unwrap();
        assert_eq!(addr, NetAddr::new("192.168.1.10", 7846));
        assert_eq!(parsed, id);
        assert_eq!(to_multiaddr(&addr, &id), ma);

        assert!(parse_multiaddr("/ip4/1.2.3.4/udp/7846/p2p/abc").is_err());
        assert!(parse_multiaddr("/ip4/300.2.3.4/tcp/7846/p2p/abc").is_err());
    }

    #[test]
    fn test_cidr_contains() {
        let c: Cidr = "10.1.0.0/16".parse().unwrap();
        assert!(c.contains(&"10.1.200.3".parse().unwrap()));
        assert!(!c.contains(&"10.2.0.1".parse().unwrap()));
        assert!(!c.contains(&"::1".parse().unwrap()));

        let all: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(&"8.8.8.8".parse().unwrap()));
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_classify_zone() {
        let internal = vec!["172.16.0.0/12".parse().unwrap()];
        assert_eq!(
            classify_zone(Some("172.20.1.1".parse().unwrap()), &internal),
            PeerZone::Internal
        );
        assert_eq!(
            classify_zone(Some("8.8.4.4".parse().unwrap()), &internal),
            PeerZone::External
        );
        assert_eq!(classify_zone(None, &internal), PeerZone::External);
    }

    #[test]
    fn test_block_hash_depends_on_txs() {
        let header = BlockHeader {
            chain_id: Bytes::from_static(b"test"),
            prev_block_hash: Hash32::default(),
            block_no: 1,
            timestamp: 0,
        };
        let a = Block::new(header.clone(), vec![Tx::new(&b"a"[..])]);
        let b = Block::new(header, vec![Tx::new(&b"b"[..])]);
        assert_ne!(a.hash, b.hash);

        let decoded = Block::decode(&a.encode().unwrap()).unwrap();
        assert_eq!(decoded, a);
    }

    #[test]
    fn test_unknown_role_is_watcher() {
        assert_eq!(PeerRole::from_u8(0), PeerRole::Watcher);
        assert_eq!(PeerRole::from_u8(PeerRole::Agent.as_u8()), PeerRole::Agent);
    }
}
