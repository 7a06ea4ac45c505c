//! P2P protocol messages.
//!
//! Each subprotocol code names the semantic class of a frame and fixes
//! the body type carried in its payload.

use crate::cert::RawCertificate;
use crate::types::{Block, BlockHeader, BlockId, PeerAddress, PeerId, ResultStatus, Tx, TxId};
use crate::wire::{
    get_bool, get_bytes, get_list, get_option, get_string, get_u32, get_u64, put_bool, put_bytes,
    put_list, put_option, put_string, Payload,
};
use crate::NetworkResult;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// 32-bit message class identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubProtocol(pub u32);

impl SubProtocol {
    pub const STATUS_REQUEST: SubProtocol = SubProtocol(0x01);
    pub const PING_REQUEST: SubProtocol = SubProtocol(0x02);
    pub const PING_RESPONSE: SubProtocol = SubProtocol(0x03);
    pub const GO_AWAY: SubProtocol = SubProtocol(0x04);
    pub const ADDRESSES_REQUEST: SubProtocol = SubProtocol(0x05);
    pub const ADDRESSES_RESPONSE: SubProtocol = SubProtocol(0x06);

    pub const GET_BLOCKS_REQUEST: SubProtocol = SubProtocol(0x10);
    pub const GET_BLOCKS_RESPONSE: SubProtocol = SubProtocol(0x11);
    pub const GET_BLOCK_HEADERS_REQUEST: SubProtocol = SubProtocol(0x12);
    pub const GET_BLOCK_HEADERS_RESPONSE: SubProtocol = SubProtocol(0x13);
    pub const GET_MISSING_REQUEST: SubProtocol = SubProtocol(0x14);
    pub const GET_MISSING_RESPONSE: SubProtocol = SubProtocol(0x15);
    pub const NEW_BLOCK_NOTICE: SubProtocol = SubProtocol(0x16);
    pub const GET_ANCESTOR_REQUEST: SubProtocol = SubProtocol(0x17);
    pub const GET_ANCESTOR_RESPONSE: SubProtocol = SubProtocol(0x18);
    pub const GET_HASHES_REQUEST: SubProtocol = SubProtocol(0x19);
    pub const GET_HASHES_RESPONSE: SubProtocol = SubProtocol(0x1a);
    pub const GET_HASH_BY_NO_REQUEST: SubProtocol = SubProtocol(0x1b);
    pub const GET_HASH_BY_NO_RESPONSE: SubProtocol = SubProtocol(0x1c);

    pub const GET_TXS_REQUEST: SubProtocol = SubProtocol(0x20);
    pub const GET_TXS_RESPONSE: SubProtocol = SubProtocol(0x21);
    pub const NEW_TX_NOTICE: SubProtocol = SubProtocol(0x22);

    pub const BLOCK_PRODUCED_NOTICE: SubProtocol = SubProtocol(0x30);
    pub const RAFT_WRAPPER: SubProtocol = SubProtocol(0x33);
    pub const ISSUE_CERT_REQUEST: SubProtocol = SubProtocol(0x34);
    pub const ISSUE_CERT_RESPONSE: SubProtocol = SubProtocol(0x35);
    pub const CERT_RENEWED_NOTICE: SubProtocol = SubProtocol(0x36);

    pub fn name(&self) -> &'static str {
        match *self {
            Self::STATUS_REQUEST => "StatusRequest",
            Self::PING_REQUEST => "PingRequest",
            Self::PING_RESPONSE => "PingResponse",
            Self::GO_AWAY => "GoAway",
            Self::ADDRESSES_REQUEST => "AddressesRequest",
            Self::ADDRESSES_RESPONSE => "AddressesResponse",
            Self::GET_BLOCKS_REQUEST => "GetBlocksRequest",
            Self::GET_BLOCKS_RESPONSE => "GetBlocksResponse",
            Self::GET_BLOCK_HEADERS_REQUEST => "GetBlockHeadersRequest",
            Self::GET_BLOCK_HEADERS_RESPONSE => "GetBlockHeadersResponse",
            Self::GET_MISSING_REQUEST => "GetMissingRequest",
            Self::GET_MISSING_RESPONSE => "GetMissingResponse",
            Self::NEW_BLOCK_NOTICE => "NewBlockNotice",
            Self::GET_ANCESTOR_REQUEST => "GetAncestorRequest",
            Self::GET_ANCESTOR_RESPONSE => "GetAncestorResponse",
            Self::GET_HASHES_REQUEST => "GetHashesRequest",
            Self::GET_HASHES_RESPONSE => "GetHashesResponse",
            Self::GET_HASH_BY_NO_REQUEST => "GetHashByNoRequest",
            Self::GET_HASH_BY_NO_RESPONSE => "GetHashByNoResponse",
            Self::GET_TXS_REQUEST => "GetTXsRequest",
            Self::GET_TXS_RESPONSE => "GetTxsResponse",
            Self::NEW_TX_NOTICE => "NewTxNotice",
            Self::BLOCK_PRODUCED_NOTICE => "BlockProducedNotice",
            Self::RAFT_WRAPPER => "RaftWrapperMessage",
            Self::ISSUE_CERT_REQUEST => "IssueCertificateRequest",
            Self::ISSUE_CERT_RESPONSE => "IssueCertificateResponse",
            Self::CERT_RENEWED_NOTICE => "CertificateRenewedNotice",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for SubProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.0)
    }
}

impl fmt::Debug for SubProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Chain status exchanged during the inner handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    pub chain_id: Bytes,
    pub best_block_hash: BlockId,
    pub best_height: u64,
    pub sender: Option<PeerAddress>,
    pub no_expose: bool,
    pub version: String,
    pub genesis: Option<BlockId>,
    pub certificates: Vec<RawCertificate>,
}

impl Payload for Status {
    fn write_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.chain_id);
        self.best_block_hash.write_to(buf);
        buf.put_u64(self.best_height);
        put_option(buf, &self.sender);
        put_bool(buf, self.no_expose);
        put_string(buf, &self.version);
        put_option(buf, &self.genesis);
        put_list(buf, &self.certificates);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            chain_id: get_bytes(buf)?,
            best_block_hash: BlockId::read_from(buf)?,
            best_height: get_u64(buf)?,
            sender: get_option(buf)?,
            no_expose: get_bool(buf)?,
            version: get_string(buf)?,
            genesis: get_option(buf)?,
            certificates: get_list(buf)?,
        })
    }
}

/// Keepalive carrying the sender's best block; used by both request and response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ping {
    pub best_block_hash: BlockId,
    pub best_height: u64,
}

impl Payload for Ping {
    fn write_to(&self, buf: &mut BytesMut) {
        self.best_block_hash.write_to(buf);
        buf.put_u64(self.best_height);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            best_block_hash: BlockId::read_from(buf)?,
            best_height: get_u64(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GoAwayNotice {
    pub message: String,
}

impl Payload for GoAwayNotice {
    fn write_to(&self, buf: &mut BytesMut) {
        put_string(buf, &self.message);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            message: get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressesRequest {
    pub sender: PeerAddress,
    pub max_size: u32,
}

impl Payload for AddressesRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        self.sender.write_to(buf);
        buf.put_u32(self.max_size);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            sender: PeerAddress::read_from(buf)?,
            max_size: get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressesResponse {
    pub status: ResultStatus,
    pub peers: Vec<PeerAddress>,
}

impl Payload for AddressesResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.status.write_to(buf);
        put_list(buf, &self.peers);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            status: ResultStatus::read_from(buf)?,
            peers: get_list(buf)?,
        })
    }
}

/// A request naming blocks by hash. Shared by GetBlocks and GetAncestor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HashesRequest {
    pub hashes: Vec<BlockId>,
}

impl Payload for HashesRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        put_list(buf, &self.hashes);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            hashes: get_list(buf)?,
        })
    }
}

pub type GetBlockRequest = HashesRequest;
pub type GetAncestorRequest = HashesRequest;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetBlockResponse {
    pub status: ResultStatus,
    pub blocks: Vec<Block>,
    pub has_next: bool,
}

impl Payload for GetBlockResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.status.write_to(buf);
        put_list(buf, &self.blocks);
        put_bool(buf, self.has_next);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            status: ResultStatus::read_from(buf)?,
            blocks: get_list(buf)?,
            has_next: get_bool(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetBlockHeadersRequest {
    /// Starting block; when absent `height` is used.
    pub hash: Option<BlockId>,
    pub height: u64,
    pub offset: u64,
    pub size: u32,
    pub asc: bool,
}

impl Payload for GetBlockHeadersRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        put_option(buf, &self.hash);
        buf.put_u64(self.height);
        buf.put_u64(self.offset);
        buf.put_u32(self.size);
        put_bool(buf, self.asc);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            hash: get_option(buf)?,
            height: get_u64(buf)?,
            offset: get_u64(buf)?,
            size: get_u32(buf)?,
            asc: get_bool(buf)?,
        })
    }
}

/// Headers paired with their hashes. Answers both GetBlockHeaders and GetMissing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeadersResponse {
    pub status: ResultStatus,
    pub hashes: Vec<BlockId>,
    pub headers: Vec<BlockHeader>,
    pub has_next: bool,
}

impl Payload for HeadersResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.status.write_to(buf);
        put_list(buf, &self.hashes);
        put_list(buf, &self.headers);
        put_bool(buf, self.has_next);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            status: ResultStatus::read_from(buf)?,
            hashes: get_list(buf)?,
            headers: get_list(buf)?,
            has_next: get_bool(buf)?,
        })
    }
}

pub type GetBlockHeadersResponse = HeadersResponse;
pub type GetMissingResponse = HeadersResponse;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetMissingRequest {
    /// Known block hashes of the requester, best first.
    pub hashes: Vec<BlockId>,
    pub stop_hash: BlockId,
}

impl Payload for GetMissingRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        put_list(buf, &self.hashes);
        self.stop_hash.write_to(buf);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            hashes: get_list(buf)?,
            stop_hash: BlockId::read_from(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewBlockNotice {
    pub block_hash: BlockId,
    pub block_no: u64,
}

impl Payload for NewBlockNotice {
    fn write_to(&self, buf: &mut BytesMut) {
        self.block_hash.write_to(buf);
        buf.put_u64(self.block_no);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            block_hash: BlockId::read_from(buf)?,
            block_no: get_u64(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetAncestorResponse {
    pub status: ResultStatus,
    pub ancestor_hash: Option<BlockId>,
    pub ancestor_no: u64,
}

impl Payload for GetAncestorResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.status.write_to(buf);
        put_option(buf, &self.ancestor_hash);
        buf.put_u64(self.ancestor_no);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            status: ResultStatus::read_from(buf)?,
            ancestor_hash: get_option(buf)?,
            ancestor_no: get_u64(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetHashesRequest {
    pub prev_hash: BlockId,
    pub prev_number: u64,
    pub size: u64,
}

impl Payload for GetHashesRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        self.prev_hash.write_to(buf);
        buf.put_u64(self.prev_number);
        buf.put_u64(self.size);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            prev_hash: BlockId::read_from(buf)?,
            prev_number: get_u64(buf)?,
            size: get_u64(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetHashesResponse {
    pub status: ResultStatus,
    pub hashes: Vec<BlockId>,
    pub has_next: bool,
}

impl Payload for GetHashesResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.status.write_to(buf);
        put_list(buf, &self.hashes);
        put_bool(buf, self.has_next);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            status: ResultStatus::read_from(buf)?,
            hashes: get_list(buf)?,
            has_next: get_bool(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetHashByNo {
    pub block_no: u64,
}

impl Payload for GetHashByNo {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64(self.block_no);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            block_no: get_u64(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetHashByNoResponse {
    pub status: ResultStatus,
    pub block_hash: Option<BlockId>,
}

impl Payload for GetHashByNoResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.status.write_to(buf);
        put_option(buf, &self.block_hash);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            status: ResultStatus::read_from(buf)?,
            block_hash: get_option(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetTransactionsRequest {
    pub hashes: Vec<TxId>,
}

impl Payload for GetTransactionsRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        put_list(buf, &self.hashes);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            hashes: get_list(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetTransactionsResponse {
    pub status: ResultStatus,
    pub hashes: Vec<TxId>,
    pub txs: Vec<Tx>,
    pub has_next: bool,
}

impl Payload for GetTransactionsResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.status.write_to(buf);
        put_list(buf, &self.hashes);
        put_list(buf, &self.txs);
        put_bool(buf, self.has_next);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            status: ResultStatus::read_from(buf)?,
            hashes: get_list(buf)?,
            txs: get_list(buf)?,
            has_next: get_bool(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewTransactionsNotice {
    pub tx_hashes: Vec<TxId>,
}

impl Payload for NewTransactionsNotice {
    fn write_to(&self, buf: &mut BytesMut) {
        put_list(buf, &self.tx_hashes);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            tx_hashes: get_list(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockProducedNotice {
    pub producer_id: PeerId,
    pub block_no: u64,
    pub block: Block,
}

impl Payload for BlockProducedNotice {
    fn write_to(&self, buf: &mut BytesMut) {
        self.producer_id.write_to(buf);
        buf.put_u64(self.block_no);
        self.block.write_to(buf);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            producer_id: PeerId::read_from(buf)?,
            block_no: get_u64(buf)?,
            block: Block::read_from(buf)?,
        })
    }
}

/// Opaque consensus message relayed for the raft cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RaftWrapperMessage {
    pub msg_type: u32,
    pub body: Bytes,
}

impl Payload for RaftWrapperMessage {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.msg_type);
        put_bytes(buf, &self.body);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            msg_type: get_u32(buf)?,
            body: get_bytes(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IssueCertificateRequest;

impl Payload for IssueCertificateRequest {
    fn write_to(&self, _buf: &mut BytesMut) {}

    fn read_from(_buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IssueCertificateResponse {
    pub status: ResultStatus,
    pub certificate: Option<RawCertificate>,
}

impl Payload for IssueCertificateResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.status.write_to(buf);
        put_option(buf, &self.certificate);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            status: ResultStatus::read_from(buf)?,
            certificate: get_option(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRenewedNotice {
    pub certificate: RawCertificate,
}

impl Payload for CertificateRenewedNotice {
    fn write_to(&self, buf: &mut BytesMut) {
        self.certificate.write_to(buf);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            certificate: RawCertificate::read_from(buf)?,
        })
    }
}
