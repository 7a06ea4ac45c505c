//! Node configuration.

use crate::Args;
use aergo_p2p::{ConsensusKind, P2PConfig, PeerId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub p2p: P2PConfig,
    pub consensus: ConsensusConfig,
    pub chain: ChainConfig,
}

/// Consensus settings the P2P layer depends on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// This node produces blocks.
    pub enable_bp: bool,
    pub kind: ConsensusKind,
    /// Fixed producer set reported as the vote result (base58 peer ids).
    pub bp_ids: Vec<String>,
}

impl ConsensusConfig {
    pub fn bp_ids(&self) -> Result<Vec<PeerId>> {
        self.bp_ids
            .iter()
            .map(|s| PeerId::from_str(s).with_context(|| format!("Invalid producer id: {}", s)))
            .collect()
    }
}

/// Genesis parameters of the relay chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub chain_id: String,
    pub genesis_timestamp: i64,
    /// Recently seen transactions kept by the relay mempool.
    pub mempool_size: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: "aergo.io".to_string(),
            genesis_timestamp: 0,
            mempool_size: 10_000,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        if let Some(port) = args.p2p_port {
            config.p2p.net_protocol_port = port;
        }
        config.p2p.np_add_peers.extend(args.add_peer.iter().cloned());

        config
            .p2p
            .validate(config.consensus.enable_bp)
            .context("Invalid p2p configuration")?;
        config.consensus.bp_ids()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aergo_p2p::NodeKey;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_parse_sections() {
        let config = NodeConfig::parse(
            r#"
            [p2p]
            net_protocol_port = 7850
            np_discover_peers = false
            peer_role = "producer"

            [consensus]
            enable_bp = true
            kind = "raft"

            [chain]
            chain_id = "local"
            "#,
        )
        .unwrap();
        assert_eq!(config.p2p.net_protocol_port, 7850);
        assert!(!config.p2p.np_discover_peers);
        assert_eq!(config.p2p.np_max_peers, P2PConfig::default().np_max_peers);
        assert_eq!(config.consensus.kind, ConsensusKind::Raft);
        assert!(config.consensus.enable_bp);
        assert_eq!(config.chain.chain_id, "local");
        assert_eq!(config.chain.mempool_size, 10_000);
    }

    #[test]
    fn test_cli_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = NodeConfig::default();
        file.p2p.net_protocol_port = 7000;
        file.save(&path).unwrap();

        let peer = format!("/ip4/10.0.0.1/tcp/7846/p2p/{}", NodeKey::generate().id());
        let args = Args::parse_from([
            "aergo-node",
            "--config",
            path.to_str().unwrap(),
            "--p2p-port",
            "7001",
            "--add-peer",
            &peer,
        ]);
        let config = NodeConfig::load(&path, &args).unwrap();
        assert_eq!(config.p2p.net_protocol_port, 7001);
        assert_eq!(config.p2p.np_add_peers, vec![peer]);
    }

    #[test]
    fn test_role_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[p2p]\npeer_role = \"producer\"\n").unwrap();
        let args = Args::parse_from(["aergo-node"]);
        assert!(NodeConfig::load(&path, &args).is_err());
    }
}
