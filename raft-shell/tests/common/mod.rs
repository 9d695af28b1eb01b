//! Harness for integration tests that run real Raft nodes over localhost TCP.
#![allow(dead_code)]

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use raft_shell::cluster::ClusterConnectionManager;
use raft_shell::config::ConnectionSettings;
use raft_shell::runtime::{NodeConfig, NodeHandle, NodeStatus, spawn_node};

pub const OP_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TestCluster {
    handles: Vec<NodeHandle>,
}

impl TestCluster {
    /// Spawns `n` nodes with ids 1..=n on ports `base_port..base_port + n`.
    pub fn spawn(n: usize, base_port: u16) -> Result<Self> {
        let peers: HashMap<u64, String> = (0..n)
            .map(|i| ((i + 1) as u64, format!("127.0.0.1:{}", base_port + i as u16)))
            .collect();

        let mut handles = Vec::new();
        for i in 0..n {
            let id = (i + 1) as u64;
            handles.push(spawn_node(NodeConfig {
                id,
                listen_addr: peers[&id].clone(),
                peers: peers.clone(),
            })?);
        }

        thread::sleep(Duration::from_millis(100));
        Ok(Self { handles })
    }

    /// Handle by 1-indexed node id.
    pub fn node(&self, id: usize) -> &NodeHandle {
        &self.handles[id - 1]
    }

    pub fn handles(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.handles.iter().cloned()
    }

    pub fn manager(&self, settings: ConnectionSettings) -> ClusterConnectionManager {
        ClusterConnectionManager::new(self.handles(), settings)
    }

    pub fn status(&self, id: usize) -> Result<NodeStatus> {
        Ok(self.node(id).status()?)
    }

    pub fn wait_for_node_to_become_leader(&self, id: usize, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                bail!("timeout waiting for node {id} to become leader");
            }
            if self.node(id).status().is_ok_and(|status| status.is_leader()) {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Returns the 1-indexed id of the only leader.
    pub fn wait_for_single_leader(&self, timeout: Duration) -> Result<usize> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                bail!("timeout waiting for leader election");
            }
            let leaders: Vec<usize> = (1..=self.handles.len())
                .filter(|&id| self.node(id).status().is_ok_and(|status| status.is_leader()))
                .collect();
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn elect(&self, id: usize) -> Result<()> {
        self.node(id).campaign()?;
        self.wait_for_node_to_become_leader(id, Duration::from_secs(5))
    }

    /// Campaigns from `id` until it leads. A lagging log can lose a vote, so retry.
    pub fn transfer_leadership(&self, id: usize) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(15) {
            self.node(id).campaign()?;
            if self
                .wait_for_node_to_become_leader(id, Duration::from_secs(2))
                .is_ok()
            {
                return Ok(());
            }
        }
        bail!("node {id} never took over leadership")
    }

    /// Waits until node `id` has applied `key` with `expected` (None = absent).
    pub fn wait_for_value(
        &self,
        id: usize,
        key: &str,
        expected: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            let status = self.status(id)?;
            if status.store.get(key).map(String::as_str) == expected {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("node {id} has {key}={:?}, expected {expected:?}", status.store.get(key));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn shutdown(self) -> Result<()> {
        for handle in &self.handles {
            let _ = handle.shutdown();
        }
        thread::sleep(Duration::from_millis(100));
        Ok(())
    }
}

pub fn settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_attempts: 50,
        retry_backoff_ms: 100,
        operation_timeout_ms: 3000,
        stale_leader_retries: 1,
    }
}
