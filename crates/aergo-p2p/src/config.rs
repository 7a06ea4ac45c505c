//! P2P configuration.

use crate::types::{parse_multiaddr, Cidr, NetAddr, PeerId, PeerMeta, PeerRole};
use crate::{NetworkError, NetworkResult, DEFAULT_PORT, MAGIC_MAIN};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Consensus flavour, which decides how producers are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    #[default]
    Dpos,
    Raft,
}

/// Options of the P2P layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2PConfig {
    /// Advertised address.
    pub net_protocol_addr: String,
    /// Advertised port.
    pub net_protocol_port: u16,
    /// Listener address. Empty means the advertised one.
    pub np_bind_addr: String,
    /// Listener port. Zero means the advertised one.
    pub np_bind_port: u16,
    /// Designated peers as multiaddrs.
    pub np_add_peers: Vec<String>,
    /// Peer ids (base58) that are never advertised to others.
    pub np_hidden_peers: Vec<String>,
    /// Soft cap on waiting peers kept by discovery.
    pub np_peer_pool: usize,
    /// Hard cap on connected peers.
    pub np_max_peers: usize,
    /// Path of the node key file.
    pub np_key: PathBuf,
    /// Whether this node lets others advertise it.
    pub np_expose_self: bool,
    /// One of "producer", "agent", "watcher" or empty.
    pub peer_role: String,
    /// Producers represented by an agent, base58 peer ids.
    pub producers: Vec<String>,
    pub np_discover_peers: bool,
    pub np_use_polaris: bool,
    /// Networks in CIDR notation treated as the internal zone.
    pub internal_zones: Vec<String>,
    /// Handshake magic.
    pub chain_magic: u32,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            net_protocol_addr: "127.0.0.1".to_string(),
            net_protocol_port: DEFAULT_PORT,
            np_bind_addr: String::new(),
            np_bind_port: 0,
            np_add_peers: Vec::new(),
            np_hidden_peers: Vec::new(),
            np_peer_pool: 100,
            np_max_peers: 100,
            np_key: PathBuf::from("p2p.key"),
            np_expose_self: true,
            peer_role: String::new(),
            producers: Vec::new(),
            np_discover_peers: true,
            np_use_polaris: false,
            internal_zones: Vec::new(),
            chain_magic: MAGIC_MAIN,
        }
    }
}

impl P2PConfig {
    /// Check the whole configuration, including the role combination.
    pub fn validate(&self, enable_bp: bool) -> NetworkResult<()> {
        self.self_role(enable_bp)?;
        self.designated_peers()?;
        self.hidden_peer_ids()?;
        self.internal_cidrs()?;
        if self.np_max_peers == 0 {
            return Err(NetworkError::Config("np_max_peers must be positive".into()));
        }
        if !self.advertised_addr().is_dialable() {
            return Err(NetworkError::Config(format!(
                "Advertised address is not usable: {}",
                self.advertised_addr()
            )));
        }
        Ok(())
    }

    /// Role of this node. Fails on combinations that cannot work.
    pub fn self_role(&self, enable_bp: bool) -> NetworkResult<PeerRole> {
        let role = match self.peer_role.trim().to_ascii_lowercase().as_str() {
            "" => {
                if enable_bp {
                    PeerRole::Producer
                } else {
                    PeerRole::Watcher
                }
            }
            "producer" => PeerRole::Producer,
            "agent" => PeerRole::Agent,
            "watcher" => PeerRole::Watcher,
            other => {
                return Err(NetworkError::Config(format!("Unknown peer role: {}", other)));
            }
        };
        match role {
            PeerRole::Producer if !enable_bp => Err(NetworkError::Config(
                "producer role requires block production enabled".into(),
            )),
            PeerRole::Agent | PeerRole::Watcher if enable_bp => Err(NetworkError::Config(format!(
                "{} role cannot produce blocks",
                role
            ))),
            PeerRole::Agent if self.producers.is_empty() => Err(NetworkError::Config(
                "agent role requires at least one producer".into(),
            )),
            _ => Ok(role),
        }
    }

    pub fn producer_ids(&self) -> NetworkResult<Vec<PeerId>> {
        parse_ids(&self.producers, "producer")
    }

    pub fn hidden_peer_ids(&self) -> NetworkResult<Vec<PeerId>> {
        parse_ids(&self.np_hidden_peers, "hidden peer")
    }

    /// Configured peers, flagged as designated.
    pub fn designated_peers(&self) -> NetworkResult<Vec<PeerMeta>> {
        self.np_add_peers
            .iter()
            .map(|s| {
                let (addr, id) = parse_multiaddr(s)?;
                let mut meta = PeerMeta::with_id(id);
                meta.addresses = vec![addr];
                meta.designated = true;
                Ok(meta)
            })
            .collect()
    }

    pub fn internal_cidrs(&self) -> NetworkResult<Vec<Cidr>> {
        self.internal_zones.iter().map(|s| s.parse()).collect()
    }

    pub fn advertised_addr(&self) -> NetAddr {
        NetAddr::new(self.net_protocol_addr.clone(), self.net_protocol_port)
    }

    pub fn bind_addr(&self) -> NetAddr {
        let host = if self.np_bind_addr.is_empty() {
            self.net_protocol_addr.clone()
        } else {
            self.np_bind_addr.clone()
        };
        let port = if self.np_bind_port == 0 {
            self.net_protocol_port
        } else {
            self.np_bind_port
        };
        NetAddr::new(host, port)
    }
}

fn parse_ids(values: &[String], what: &str) -> NetworkResult<Vec<PeerId>> {
    values
        .iter()
        .map(|s| {
            s.parse()
                .map_err(|e| NetworkError::Config(format!("Invalid {} id {}: {}", what, s, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::NodeKey;

    #[test]
    fn test_role_combinations() {
        let mut cfg = P2PConfig::default();
        assert_eq!(cfg.self_role(true).unwrap(), PeerRole::Producer);
        assert_eq!(cfg.self_role(false).unwrap(), PeerRole::Watcher);

        cfg.peer_role = "producer".into();
        assert!(cfg.self_role(false).is_err());

        cfg.peer_role = "watcher".into();
        assert!(cfg.self_role(true).is_err());

        cfg.peer_role = "agent".into();
        assert!(cfg.self_role(false).is_err());
        cfg.producers = vec![NodeKey::generate().id().to_string()];
        assert_eq!(cfg.self_role(false).unwrap(), PeerRole::Agent);
        assert!(cfg.self_role(true).is_err());

        cfg.peer_role = "miner".into();
        assert!(cfg.self_role(false).is_err());
    }

    #[test]
    fn test_designated_peers_and_bind() {
        let id = NodeKey::generate().id();
        let cfg = P2PConfig {
            np_add_peers: vec![format!("/ip4/10.1.2.3/tcp/7846/p2p/{}", id)],
            np_bind_addr: "0.0.0.0".into(),
            ..Default::default()
        };
        let peers = cfg.designated_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, id);
        assert!(peers[0].designated);
        assert_eq!(peers[0].addresses[0], NetAddr::new("10.1.2.3", 7846));
        assert_eq!(cfg.bind_addr(), NetAddr::new("0.0.0.0", DEFAULT_PORT));
        cfg.validate(false).unwrap();

        let bad = P2PConfig {
            np_add_peers: vec!["/ip4/10.1.2.3/tcp/7846".into()],
            ..Default::default()
        };
        assert!(bad.validate(false).is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: P2PConfig = toml::from_str(
            r#"
            net_protocol_port = 17846
            internal_zones = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.net_protocol_port, 17846);
        assert_eq!(cfg.np_max_peers, 100);
        assert_eq!(cfg.internal_cidrs().unwrap().len(), 1);
        assert_eq!(cfg.chain_magic, MAGIC_MAIN);
    }
}
