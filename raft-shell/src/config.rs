//! Shell configuration: an optional TOML file, overridden by command-line flags.
//!
//! ```toml
//! [cluster]
//! bootstrap = 1
//! peers = [
//!     { id = 1, addr = "127.0.0.1:7101" },
//!     { id = 2, addr = "127.0.0.1:7102" },
//!     { id = 3, addr = "127.0.0.1:7103" },
//! ]
//!
//! [connection]
//! connect_attempts = 30
//! retry_backoff_ms = 100
//! operation_timeout_ms = 3000
//! stale_leader_retries = 1
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::topology::ReplicaTopology;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    pub cluster: ClusterConfig,
    pub connection: ConnectionSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Node that campaigns once the cluster is up. Lowest id when unset.
    pub bootstrap: Option<u64>,
    pub peers: Vec<PeerEntry>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap: None,
            peers: (1..=3)
                .map(|id| PeerEntry {
                    id,
                    addr: format!("127.0.0.1:{}", 7100 + id),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub id: u64,
    pub addr: String,
}

impl PeerEntry {
    /// Parses the `id=addr` form used on the command line.
    pub fn parse(entry: &str) -> Result<Self> {
        let Some((id, addr)) = entry.split_once('=') else {
            anyhow::bail!("invalid peer entry '{entry}', expected id=addr");
        };
        let id = id
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        let addr = addr.trim();
        ensure!(!addr.is_empty(), "missing address in peer entry '{entry}'");
        Ok(Self {
            id,
            addr: addr.to_string(),
        })
    }
}

/// Budgets used by the connection manager and the sessions it hands out.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSettings {
    /// Leader resolution rounds before `get_connection` gives up.
    pub connect_attempts: u32,
    /// Pause between resolution rounds.
    pub retry_backoff_ms: u64,
    /// Bound on a single store call.
    pub operation_timeout_ms: u64,
    /// Re-resolutions allowed after a stale-leader answer.
    pub stale_leader_retries: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 30,
            retry_backoff_ms: 100,
            operation_timeout_ms: 3000,
            stale_leader_retries: 1,
        }
    }
}

impl ConnectionSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl ShellConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.connection.connect_attempts > 0,
            "connection.connect_attempts must be at least 1"
        );
        ensure!(
            self.connection.operation_timeout_ms > 0,
            "connection.operation_timeout_ms must be positive"
        );
        Ok(())
    }

    /// Builds the validated membership; duplicate peer ids are rejected.
    pub fn topology(&self) -> Result<ReplicaTopology> {
        let mut members = BTreeMap::new();
        for peer in &self.cluster.peers {
            let previous = members.insert(peer.id, peer.addr.clone());
            ensure!(previous.is_none(), "peer id {} listed twice", peer.id);
        }
        ReplicaTopology::new(members, self.cluster.bootstrap)
    }
}
