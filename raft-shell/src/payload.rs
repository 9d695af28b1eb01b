use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Identifies a proposal so the node that proposed it can answer the waiting caller.
///
/// Only the proposer keeps a pending entry for `seq`; every other node applies the
/// command and ignores the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalTag {
    pub proposer: u64,
    pub seq: u64,
}

/// Commands that flow through the Raft replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandPayload {
    Put {
        tag: ProposalTag,
        key: String,
        value: String,
    },
    Delete {
        tag: ProposalTag,
        key: String,
    },
}

impl CommandPayload {
    pub fn key(&self) -> &str {
        match self {
            CommandPayload::Put { key, .. } | CommandPayload::Delete { key, .. } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
