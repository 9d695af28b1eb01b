use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, ensure};

use crate::runtime::NodeConfig;

/// Validated cluster membership: an odd number of voters with known addresses.
#[derive(Debug, Clone)]
pub struct ReplicaTopology {
    members: BTreeMap<u64, String>,
    bootstrap: u64,
}

impl ReplicaTopology {
    /// `bootstrap` defaults to the lowest member id.
    pub fn new(members: BTreeMap<u64, String>, bootstrap: Option<u64>) -> Result<Self> {
        ensure!(!members.is_empty(), "topology requires at least one node");
        ensure!(
            members.len() % 2 == 1,
            "topology must have an odd number of nodes, got {}",
            members.len()
        );
        ensure!(!members.contains_key(&0), "node id 0 is reserved by raft");
        let lowest = *members.keys().next().unwrap_or(&1);
        let bootstrap = bootstrap.unwrap_or(lowest);
        ensure!(
            members.contains_key(&bootstrap),
            "bootstrap node {bootstrap} is not a member"
        );
        Ok(Self { members, bootstrap })
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.members.keys().copied()
    }

    pub fn bootstrap_id(&self) -> u64 {
        self.bootstrap
    }

    /// One [`NodeConfig`] per member, each listening on its own address.
    pub fn node_configs(&self) -> Vec<NodeConfig> {
        let peers: HashMap<u64, String> = self.members.clone().into_iter().collect();
        self.members
            .iter()
            .map(|(&id, addr)| NodeConfig {
                id,
                listen_addr: addr.clone(),
                peers: peers.clone(),
            })
            .collect()
    }
}
