//! Configuration.

pub mod error;

pub use error::Error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::tablet::TabletType;

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Current configuration.
pub fn config() -> Arc<Config> {
    CONFIG.load().clone()
}

/// Load the configuration file from disk and install it globally.
pub fn load(path: &Path) -> Result<Config, Error> {
    let config = Config::load(path)?;
    set(config.clone());
    Ok(config)
}

pub fn set(config: Config) {
    CONFIG.store(Arc::new(config));
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// reshard.toml `[general]`.
    #[serde(default)]
    pub general: General,
    /// `[topology]`: where the store lives.
    #[serde(default)]
    pub topology: Topology,
    /// `[[tablets]]`: the local-mode fleet.
    #[serde(default)]
    pub tablets: Vec<TabletConfig>,
}

impl Config {
    /// Load configuration from disk or use defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents)?;
                info!("loaded \"{}\"", path.display());
                config
            }
            Err(_) => {
                warn!(
                    "\"{}\" doesn't exist, loading defaults instead",
                    path.display()
                );
                Config::default()
            }
        };

        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    /// Tokio runtime threads. 0 = current thread.
    #[serde(default = "General::workers")]
    pub workers: usize,
    /// How long a primary cutover waits for destinations to catch up, ms.
    #[serde(default = "General::filtered_replication_wait_time")]
    pub filtered_replication_wait_time: u64,
    /// Sleep after migrating RDONLY serving before refreshing, ms.
    #[serde(default = "General::rdonly_drain_sleep")]
    pub rdonly_drain_sleep: u64,
    /// Sleep after migrating REPLICA serving before refreshing, ms.
    #[serde(default = "General::replica_drain_sleep")]
    pub replica_drain_sleep: u64,
    /// Drain waiter: delay between drain checks, ms.
    #[serde(default = "General::drain_retry_delay")]
    pub drain_retry_delay: u64,
    /// Drain waiter: warm-up before the first check, ms.
    #[serde(default = "General::drain_initial_wait")]
    pub drain_initial_wait: u64,
    /// Drain waiter: how often the healthcheck re-reads topology, ms.
    #[serde(default = "General::healthcheck_topology_refresh")]
    pub healthcheck_topology_refresh: u64,
    /// Drain waiter: backoff after a healthcheck error, ms.
    #[serde(default = "General::healthcheck_retry_delay")]
    pub healthcheck_retry_delay: u64,
    /// Drain waiter: budget for discovering the first healthy tablet, ms.
    #[serde(default = "General::healthcheck_timeout")]
    pub healthcheck_timeout: u64,
}

impl General {
    fn workers() -> usize {
        0
    }

    fn filtered_replication_wait_time() -> u64 {
        Duration::from_secs(30).as_millis() as u64
    }

    fn rdonly_drain_sleep() -> u64 {
        Duration::from_secs(5).as_millis() as u64
    }

    fn replica_drain_sleep() -> u64 {
        Duration::from_secs(15).as_millis() as u64
    }

    fn drain_retry_delay() -> u64 {
        Duration::from_secs(1).as_millis() as u64
    }

    fn drain_initial_wait() -> u64 {
        Duration::from_secs(60).as_millis() as u64
    }

    fn healthcheck_topology_refresh() -> u64 {
        Duration::from_secs(30).as_millis() as u64
    }

    fn healthcheck_retry_delay() -> u64 {
        Duration::from_secs(5).as_millis() as u64
    }

    fn healthcheck_timeout() -> u64 {
        Duration::from_secs(60).as_millis() as u64
    }

    pub fn filtered_replication_wait(&self) -> Duration {
        Duration::from_millis(self.filtered_replication_wait_time)
    }

    /// Sleep applied after a non-primary serving migration, before the
    /// disabled shards are refreshed.
    pub fn drain_sleep(&self, tablet_type: TabletType) -> Duration {
        match tablet_type {
            TabletType::Rdonly => Duration::from_millis(self.rdonly_drain_sleep),
            _ => Duration::from_millis(self.replica_drain_sleep),
        }
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            workers: Self::workers(),
            filtered_replication_wait_time: Self::filtered_replication_wait_time(),
            rdonly_drain_sleep: Self::rdonly_drain_sleep(),
            replica_drain_sleep: Self::replica_drain_sleep(),
            drain_retry_delay: Self::drain_retry_delay(),
            drain_initial_wait: Self::drain_initial_wait(),
            healthcheck_topology_refresh: Self::healthcheck_topology_refresh(),
            healthcheck_retry_delay: Self::healthcheck_retry_delay(),
            healthcheck_timeout: Self::healthcheck_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    /// Root directory of the file-backed store.
    #[serde(default = "Topology::root")]
    pub root: PathBuf,
    /// Cells the cluster spans.
    #[serde(default = "Topology::cells")]
    pub cells: Vec<String>,
}

impl Topology {
    fn root() -> PathBuf {
        PathBuf::from("reshard-topo")
    }

    fn cells() -> Vec<String> {
        vec!["local".to_string()]
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            root: Self::root(),
            cells: Self::cells(),
        }
    }
}

/// One local-mode tablet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TabletConfig {
    pub cell: String,
    pub uid: u32,
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub http_port: Option<u16>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let general = General::default();
        assert_eq!(general.filtered_replication_wait(), Duration::from_secs(30));
        assert_eq!(
            general.drain_sleep(TabletType::Rdonly),
            Duration::from_secs(5)
        );
        assert_eq!(
            general.drain_sleep(TabletType::Replica),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_parse() {
        let config: Config = toml::from_str(
            r#"
[general]
filtered_replication_wait_time = 10_000
rdonly_drain_sleep = 100

[topology]
root = "/tmp/reshard"
cells = ["zone1", "zone2"]

[[tablets]]
cell = "zone1"
uid = 100
keyspace = "ks"
shard = "0"
tablet_type = "PRIMARY"
"#,
        )
        .unwrap();

        assert_eq!(
            config.general.filtered_replication_wait(),
            Duration::from_secs(10)
        );
        assert_eq!(config.general.drain_sleep(TabletType::Rdonly).as_millis(), 100);
        assert_eq!(config.topology.cells, vec!["zone1", "zone2"]);
        assert_eq!(config.tablets[0].tablet_type, TabletType::Primary);
    }
}
