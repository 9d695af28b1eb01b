//! Connection manager backed by the in-process Raft nodes.
//!
//! The manager keeps a leader cache shared by every session it creates. A
//! session routes all store calls to the leader it was opened against and, on a
//! stale-leader answer, re-resolves the leader a bounded number of times
//! before giving up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::connection::{Connection, ConnectionManager, StoreClient};
use crate::error::{ConnectionError, Outcome, StoreError};
use crate::runtime::NodeHandle;

/// Leader lookup state shared between the manager and its sessions.
struct LeaderRouter {
    members: BTreeMap<u64, NodeHandle>,
    leader: Mutex<Option<u64>>,
    settings: ConnectionSettings,
}

impl LeaderRouter {
    fn cached_leader(&self) -> Option<u64> {
        *self.leader.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember(&self, id: Option<u64>) {
        *self.leader.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = id;
    }

    fn is_leader(&self, id: u64) -> bool {
        self.members
            .get(&id)
            .and_then(|handle| handle.status().ok())
            .is_some_and(|status| status.is_leader())
    }

    /// Cache first, then every member, for up to `connect_attempts` rounds.
    fn resolve(&self) -> Result<u64, ConnectionError> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut any_reachable = false;

        for attempt in 1..=attempts {
            if let Some(id) = self.cached_leader() {
                if self.is_leader(id) {
                    return Ok(id);
                }
                debug!(leader = id, "cached leader is stale");
                self.remember(None);
            }

            for handle in self.members.values() {
                match handle.status() {
                    Ok(status) => {
                        any_reachable = true;
                        if status.is_leader() {
                            info!(leader = status.node_id, term = status.term, attempt, "leader resolved");
                            self.remember(Some(status.node_id));
                            return Ok(status.node_id);
                        }
                    }
                    Err(err) => debug!(node_id = handle.id(), error = %err, "member did not answer"),
                }
            }

            if attempt < attempts {
                thread::sleep(self.settings.retry_backoff());
            }
        }

        if any_reachable {
            Err(ConnectionError::NoLeader { attempts })
        } else {
            Err(ConnectionError::Unreachable { attempts })
        }
    }

    /// Picks a new leader after `stale` answered NotLeader.
    fn reresolve(&self, stale: u64, hint: u64) -> Result<u64, ConnectionError> {
        if self.cached_leader() == Some(stale) {
            self.remember(None);
        }
        if hint != 0 && hint != stale && self.is_leader(hint) {
            self.remember(Some(hint));
            return Ok(hint);
        }
        self.resolve()
    }
}

/// Hands out sessions against the current Raft leader.
#[derive(Clone)]
pub struct ClusterConnectionManager {
    router: Arc<LeaderRouter>,
    next_session: Arc<AtomicU64>,
}

impl ClusterConnectionManager {
    pub fn new(members: impl IntoIterator<Item = NodeHandle>, settings: ConnectionSettings) -> Self {
        let members = members.into_iter().map(|handle| (handle.id(), handle)).collect();
        Self {
            router: Arc::new(LeaderRouter {
                members,
                leader: Mutex::new(None),
                settings,
            }),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Leader id from the shared cache, without contacting any node.
    pub fn cached_leader(&self) -> Option<u64> {
        self.router.cached_leader()
    }
}

impl ConnectionManager for ClusterConnectionManager {
    fn get_connection(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        let leader = self.router.resolve()?;
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session = session_id, leader, "session opened");
        Ok(Box::new(ClusterConnection {
            session_id,
            router: Arc::clone(&self.router),
            leader: AtomicU64::new(leader),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One session, routed to the leader it was opened against.
pub struct ClusterConnection {
    session_id: u64,
    router: Arc<LeaderRouter>,
    leader: AtomicU64,
    closed: AtomicBool,
}

impl ClusterConnection {
    pub fn leader(&self) -> u64 {
        self.leader.load(Ordering::Acquire)
    }

    fn call<T>(
        &self,
        op: &'static str,
        request: impl Fn(&NodeHandle, Duration) -> Result<T, StoreError>,
    ) -> Outcome<T> {
        let timeout = self.router.settings.operation_timeout();
        let mut retries_left = self.router.settings.stale_leader_retries;

        loop {
            if self.is_closed() {
                return Outcome::RejectedTerminal(StoreError::Closed);
            }
            let leader = self.leader();
            let Some(handle) = self.router.members.get(&leader) else {
                return Outcome::RejectedTerminal(StoreError::Unavailable(format!(
                    "leader {leader} is not a member"
                )));
            };

            let err = match Outcome::from(request(handle, timeout)) {
                Outcome::RejectedRetryable(err) if retries_left > 0 => err,
                other => return other,
            };
            retries_left -= 1;

            let hint = match &err {
                StoreError::NotLeader { leader_hint, .. } => *leader_hint,
                _ => 0,
            };
            warn!(session = self.session_id, op, stale = leader, hint, "stale leader, re-resolving");
            match self.router.reresolve(leader, hint) {
                Ok(next) => self.leader.store(next, Ordering::Release),
                Err(resolve_err) => {
                    warn!(session = self.session_id, op, error = %resolve_err, "re-resolution failed");
                    return Outcome::RejectedRetryable(err);
                }
            }
        }
    }
}

impl StoreClient for ClusterConnection {
    fn delete(&self, key: &str) -> Outcome<()> {
        self.call("delete", |handle, timeout| handle.delete(key.to_string(), timeout))
            .map(|existed| debug!(session = self.session_id, key, existed, "delete committed"))
    }

    fn put(&self, key: &str, value: &str) -> Outcome<()> {
        self.call("put", |handle, timeout| {
            handle.put(key.to_string(), value.to_string(), timeout)
        })
    }

    fn get(&self, key: &str) -> Outcome<Option<String>> {
        self.call("get", |handle, timeout| handle.get(key.to_string(), timeout))
    }

    fn list(&self) -> Outcome<Vec<(String, String)>> {
        self.call("list", |handle, timeout| handle.list(timeout))
            .map(|entries| entries.into_iter().collect())
    }
}

impl Connection for ClusterConnection {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    fn key_value_store(&self) -> Result<&dyn StoreClient, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(self)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(session = self.session_id, "session closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
