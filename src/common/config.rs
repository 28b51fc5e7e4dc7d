use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::NodeId;
use super::error::ConfigError;

pub const DEFAULT_INITIAL_BALANCE: i64 = 1000;

/// Which deliverability predicate the servents run.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    #[default]
    Causal,
    Fifo,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotKind {
    #[default]
    AcharyaBadrinath,
    AlagarVenkatesan,
    CoordinatedCheckpointing,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            min_delay_ms: 500,
            max_delay_ms: 1500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServentConfig {
    pub id: NodeId,
    pub neighbors: Vec<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub node_count: usize,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: i64,
    #[serde(default)]
    pub delivery: DeliveryMode,
    #[serde(default)]
    pub snapshot: SnapshotKind,
    /// Every servent is a neighbor of every other, so broadcasts are not re-flooded.
    #[serde(default)]
    pub clique: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub network: NetworkConfig,
    pub servents: Vec<ServentConfig>,
}

fn default_initial_balance() -> i64 {
    DEFAULT_INITIAL_BALANCE
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Config {
    /// Full mesh of `node_count` servents.
    pub fn clique(node_count: usize, delivery: DeliveryMode, snapshot: SnapshotKind) -> Self {
        let servents = (0..node_count as NodeId)
            .map(|id| ServentConfig {
                id,
                neighbors: (0..node_count as NodeId).filter(|other| *other != id).collect(),
            })
            .collect();

        Config {
            node_count,
            initial_balance: DEFAULT_INITIAL_BALANCE,
            delivery,
            snapshot,
            clique: true,
            poll_interval_ms: default_poll_interval_ms(),
            network: NetworkConfig::default(),
            servents,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_delays(mut self, min_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.network = NetworkConfig {
            min_delay_ms,
            max_delay_ms,
        };
        self
    }

    pub fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn neighbors_of(&self, id: NodeId) -> Option<&[NodeId]> {
        self.servents
            .iter()
            .find(|servent| servent.id == id)
            .map(|servent| servent.neighbors.as_slice())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 {
            return Err(ConfigError::Invalid("node_count must be positive".into()));
        }

        let ids: BTreeSet<NodeId> = self.servents.iter().map(|servent| servent.id).collect();
        let expected: BTreeSet<NodeId> = (0..self.node_count as NodeId).collect();
        if ids != expected || self.servents.len() != self.node_count {
            return Err(ConfigError::Invalid(format!(
                "servent ids must be exactly 0..{}",
                self.node_count
            )));
        }

        if self.network.min_delay_ms > self.network.max_delay_ms {
            return Err(ConfigError::Invalid("min_delay_ms exceeds max_delay_ms".into()));
        }

        for servent in &self.servents {
            for neighbor in &servent.neighbors {
                if *neighbor == servent.id || !ids.contains(neighbor) {
                    return Err(ConfigError::Invalid(format!(
                        "servent {} lists invalid neighbor {}",
                        servent.id, neighbor
                    )));
                }

                let symmetric = self
                    .neighbors_of(*neighbor)
                    .is_some_and(|back| back.contains(&servent.id));
                if !symmetric {
                    return Err(ConfigError::Invalid(format!(
                        "link {} -> {} has no way back",
                        servent.id, neighbor
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RING: &str = r#"
        node_count = 3
        delivery = "fifo"
        snapshot = "alagar-venkatesan"

        [network]
        min_delay_ms = 5
        max_delay_ms = 10

        [[servents]]
        id = 0
        neighbors = [1, 2]

        [[servents]]
        id = 1
        neighbors = [0, 2]

        [[servents]]
        id = 2
        neighbors = [0, 1]
    "#;

    #[test]
    fn test_parse_config() {
        let config = Config::parse(RING).unwrap();

        assert_eq!(config.node_count, 3);
        assert_eq!(config.initial_balance, DEFAULT_INITIAL_BALANCE);
        assert_eq!(config.delivery, DeliveryMode::Fifo);
        assert_eq!(config.snapshot, SnapshotKind::AlagarVenkatesan);
        assert!(!config.clique);
        assert_eq!(config.neighbors_of(1), Some(&[0, 2][..]));
        assert_eq!(config.network.max_delay_ms, 10);
    }

    #[test]
    fn test_rejects_one_way_link() {
        let broken = RING.replace("neighbors = [0, 1]", "neighbors = [0]");
        let err = Config::parse(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_neighbor() {
        let broken = RING.replace("neighbors = [1, 2]", "neighbors = [1, 2, 9]");
        assert!(Config::parse(&broken).is_err());
    }

    #[test]
    fn test_clique_is_valid() {
        let config = Config::clique(4, DeliveryMode::Causal, SnapshotKind::CoordinatedCheckpointing);
        config.validate().unwrap();
        assert_eq!(config.neighbors_of(2), Some(&[0, 1, 3][..]));
    }
}
