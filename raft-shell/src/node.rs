//! Raft node: tikv/raft's `RawNode` bound to the key-value state machine.
//!
//! [`RaftNode`] is driven by the runtime worker: `tick` advances the logical
//! clock, `step` feeds peer messages, `propose` appends commands to the log and
//! `poll_ready` persists, applies and collects outbound messages.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use raft::StateRole;
use raft::prelude::{ConfState, Config, Entry, EntryType, Message, RawNode};
use raft::storage::MemStorage;
use slog::{Logger, o};

use crate::payload::{CommandPayload, ProposalTag};
use crate::store::KvStore;

/// Raft internals log through slog; the shell logs at the application level.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// What an applied entry did to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedChange {
    Put { value: String },
    Delete { existed: bool },
}

/// Produced for every committed command applied on this node.
///
/// The proposer uses `tag` to find the caller waiting on the entry.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub node_id: u64,
    pub tag: ProposalTag,
    pub key: String,
    pub change: AppliedChange,
    pub index: u64,
    pub term: u64,
}

/// Messages to send and commands applied during one `poll_ready` pass.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

/// A Raft consensus node with integrated key-value storage.
///
/// Log and hard state live in `MemStorage`; nothing survives a restart.
pub struct RaftNode {
    id: u64,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
    store: KvStore,
}

impl RaftNode {
    /// Creates a node that is one of `voters`.
    ///
    /// Timing assumes one `tick()` every 100ms: heartbeats every 3 ticks,
    /// elections after 10 ticks without a leader.
    pub fn new(id: u64, voters: &[u64]) -> Result<Self> {
        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        cfg.validate()
            .with_context(|| format!("invalid raft config for node {id}"))?;
        let storage = MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![])));
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            raw,
            storage,
            store: KvStore::new(),
        })
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn is_leader(&self) -> bool {
        self.role() == StateRole::Leader
    }

    /// Current leader id, or 0 when none is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    /// Appends a command to the local log.
    ///
    /// Success means "appended", not "committed"; commitment is reported by a
    /// later `poll_ready` as an [`ApplyReport`] carrying the same tag.
    pub fn propose(&mut self, payload: &CommandPayload) -> Result<()> {
        let data = payload.encode().context("encode command failed")?;
        self.raw.propose(vec![], data).context("propose failed")
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Runs one Ready/LightReady cycle if Raft has work.
    ///
    /// Hard state, entries and snapshots go to storage before committed
    /// entries are applied and messages are released.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }
        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }
        if !ready.snapshot().is_empty() {
            self.storage
                .wl()
                .apply_snapshot(ready.snapshot().clone())
                .context("apply snapshot failed")?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    /// Empty entries (leader no-ops) and conf changes carry no command.
    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut applied = Vec::new();
        for entry in entries {
            if entry.data.is_empty() || entry.entry_type() != EntryType::EntryNormal {
                continue;
            }
            let command = CommandPayload::decode(&entry.data).context("decode command failed")?;
            applied.push(self.apply_command(entry.index, entry.term, command));
        }
        Ok(applied)
    }

    fn apply_command(&mut self, index: u64, term: u64, cmd: CommandPayload) -> ApplyReport {
        let (tag, key, change) = match cmd {
            CommandPayload::Put { tag, key, value } => {
                self.store.put(key.clone(), value.clone());
                (tag, key, AppliedChange::Put { value })
            }
            CommandPayload::Delete { tag, key } => {
                let existed = self.store.delete(&key);
                (tag, key, AppliedChange::Delete { existed })
            }
        };
        ApplyReport {
            node_id: self.id,
            tag,
            key,
            change,
            index,
            term,
        }
    }

    /// Latest applied value on this node. No consensus round is involved.
    pub fn value_for(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.store.snapshot()
    }
}
