//! Capabilities the shell consumes: a connection provider and the key-value
//! operations reachable through a connection.
//!
//! Commands never hold a [`Connection`] directly. They go through
//! [`ScopedConnection`], which closes the session when it goes out of scope,
//! whether the command returns normally, returns early on a rejected store
//! call, or unwinds from a panic.

use crate::error::{ConnectionError, Outcome};

/// Key-value operations whose writes commit through consensus before returning.
pub trait StoreClient {
    /// Removes `key`. Commits even when the key is absent.
    fn delete(&self, key: &str) -> Outcome<()>;
    fn put(&self, key: &str, value: &str) -> Outcome<()>;
    fn get(&self, key: &str) -> Outcome<Option<String>>;
    /// Every pair, in key order.
    fn list(&self) -> Outcome<Vec<(String, String)>>;
}

/// A session against the cluster.
///
/// After `close` every store call is rejected. Closing twice is a no-op.
pub trait Connection: Send {
    fn session_id(&self) -> u64;
    fn key_value_store(&self) -> Result<&dyn StoreClient, ConnectionError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Hands out one connection per command invocation.
pub trait ConnectionManager: Send + Sync {
    fn get_connection(&self) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// Owns a connection for the duration of one command and closes it on drop.
pub struct ScopedConnection {
    conn: Box<dyn Connection>,
}

impl ScopedConnection {
    pub fn acquire(manager: &dyn ConnectionManager) -> Result<Self, ConnectionError> {
        manager.get_connection().map(|conn| Self { conn })
    }

    pub fn session_id(&self) -> u64 {
        self.conn.session_id()
    }

    pub fn store(&self) -> Result<&dyn StoreClient, ConnectionError> {
        self.conn.key_value_store()
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.conn.close();
    }
}
