//! Interactive key-value shell over a Raft-replicated store.
//!
//! An operator types `delete k1`, `put k1 v1`, `get k1`, `list` or `help`.
//! Each command validates its arguments, opens a session against the
//! cluster's leader, runs one store operation that blocks until it commits,
//! prints `done` or `failed` (or the value read), and closes the session.
//!
//! # Layers
//!
//! - [`shell`]: command registry, dispatcher and the command variants
//! - [`connection`]: the capabilities commands consume (`ConnectionManager`,
//!   `Connection`, `StoreClient`) and the scoped session guard
//! - [`cluster`]: a connection manager over in-process Raft nodes, with a
//!   shared leader cache and bounded stale-leader retry
//! - [`runtime`]: worker threads, peer networking and blocking node handles
//! - [`node`]: tikv/raft `RawNode` bound to the state machine
//! - [`store`]: in-memory key-value state machine
//! - [`payload`]: commands replicated through the Raft log
//! - [`config`], [`topology`]: configuration and cluster membership
//! - [`error`]: connection and store error taxonomy

pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod payload;
pub mod runtime;
pub mod shell;
pub mod store;
pub mod topology;
