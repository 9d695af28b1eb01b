//! Error taxonomy shared by the shell and the store it talks to.

use std::time::Duration;

use thiserror::Error;

/// Failure to obtain a usable session against the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("no cluster member reachable after {attempts} attempts")]
    Unreachable { attempts: u32 },
    #[error("cluster has no leader after {attempts} attempts")]
    NoLeader { attempts: u32 },
    #[error("connection is closed")]
    Closed,
}

/// Failure of a single store operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The contacted node is not the leader. `leader_hint` is 0 when unknown.
    #[error("node {node_id} is not the leader (leader hint: {leader_hint})")]
    NotLeader { node_id: u64, leader_hint: u64 },
    #[error("no commit within {0:?}")]
    Timeout(Duration),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("connection is closed")]
    Closed,
    #[error("node unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Only a stale leader is worth another attempt; a timed-out write may
    /// still have committed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::NotLeader { .. })
    }
}

/// Tri-state result of a store operation as seen by a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Committed(T),
    RejectedRetryable(StoreError),
    RejectedTerminal(StoreError),
}

impl<T> Outcome<T> {
    pub fn into_result(self) -> Result<T, StoreError> {
        match self {
            Outcome::Committed(value) => Ok(value),
            Outcome::RejectedRetryable(err) | Outcome::RejectedTerminal(err) => Err(err),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Committed(value) => Outcome::Committed(f(value)),
            Outcome::RejectedRetryable(err) => Outcome::RejectedRetryable(err),
            Outcome::RejectedTerminal(err) => Outcome::RejectedTerminal(err),
        }
    }
}

impl<T> From<Result<T, StoreError>> for Outcome<T> {
    fn from(result: Result<T, StoreError>) -> Self {
        match result {
            Ok(value) => Outcome::Committed(value),
            Err(err) if err.is_retryable() => Outcome::RejectedRetryable(err),
            Err(err) => Outcome::RejectedTerminal(err),
        }
    }
}

/// Why a shell command printed `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
