//! # aergo-p2p
//!
//! Peer-to-peer networking layer for the Aergo blockchain node.
//!
//! This crate provides:
//! - Length-prefixed message framing and the versioned handshake
//! - Remote peer sessions with request/response correlation
//! - Peer lifecycle management, reconnect scheduling and discovery
//! - Block producer / agent / watcher roles and agent certificates
//! - Block and transaction notice fan-out and tx pull synchronization

pub mod actor;
mod broadcast;
pub mod cert;
mod codec;
pub mod config;
mod error;
pub mod finder;
pub mod handlers;
pub mod handshake;
pub mod key;
pub mod manager;
pub mod message;
pub mod order;
pub mod peer;
pub mod role;
mod service;
pub mod sync;
pub mod tracer;
pub mod transport;
pub mod types;
pub mod waiting;
pub mod wire;

#[cfg(test)]
mod testutil;

pub use actor::{ActorService, ChainAccessor, RaftAccessor};
pub use cert::{AgentCertificate, CertificateManager, RawCertificate};
pub use codec::{
    framed, BoxStream, Message, MessageCodec, MsgFramed, MsgId, MsgSink, MsgStream, HEADER_SIZE,
};
pub use config::{ConsensusKind, P2PConfig};
pub use error::{NetworkError, NetworkResult};
pub use finder::PolarisClient;
pub use handshake::{HandshakeResult, Handshaker, P2PVersion};
pub use key::NodeKey;
pub use manager::{PeerEventListener, PeerManagerHandle};
pub use message::SubProtocol;
pub use order::{MsgOrder, MsgOrderFactory, ResponseReceiver};
pub use peer::{PeerState, RemotePeer};
pub use role::RoleManager;
pub use service::{P2PCommand, P2PHandle, P2PService, PeerInfo, ServiceDeps};
pub use types::{
    Block, BlockHeader, BlockId, Hash32, NetAddr, PeerAddress, PeerId, PeerMeta, PeerRole,
    PeerZone, ResultStatus, Tx, TxId,
};

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 7846;

/// Wire handshake magic for mainnet ("AhaG").
pub const MAGIC_MAIN: u32 = 0x4741_6841;

/// Wire handshake magic for testnet.
pub const MAGIC_TEST: u32 = 0x2e41_5429;

/// Maximum payload of a single framed message.
pub const MAX_PAYLOAD_LENGTH: usize = 1 << 23; // 8 MiB

/// Maximum size of a block accepted from a peer.
pub const MAX_BLOCK_SIZE: usize = 1 << 20;

/// Payload of a chunked response carrying no items.
pub const EMPTY_GET_BLOCK_RESPONSE_SIZE: usize = 12;

/// Maximum blocks served in one GetBlocks exchange.
pub const MAX_BLOCK_RESPONSE_COUNT: usize = 2000;

/// Maximum headers or hashes served in one response.
pub const MAX_BLOCK_HEADER_RESPONSE_COUNT: usize = 10000;

/// Maximum hashes per mempool lookup and per tx request.
pub const MAX_REQUEST_HASHES: usize = 1000;

/// Node software version advertised in status messages.
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");
