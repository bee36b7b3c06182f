//! Idle-connection cache keyed by `scheme://host:port`, letting independent
//! client calls to the same origin reuse a kept-alive `Connection` instead
//! of dialing a fresh one every time.

use std::collections::HashMap;

use mea::mutex::Mutex;

use crate::connection::Connection;
use crate::stream::AsyncStream;

pub struct ConnectionPool<S: AsyncStream> {
    idle: Mutex<HashMap<String, Connection<S>>>,
}

impl<S: AsyncStream> ConnectionPool<S> {
    pub fn new() -> Self {
        Self { idle: Mutex::new(HashMap::new()) }
    }

    pub async fn checkout(&self, key: &str) -> Option<Connection<S>> {
        self.idle.lock().await.remove(key)
    }

    /// Stores `conn` under `key` for the next caller to `checkout`, unless
    /// it is no longer keep-alive eligible.
    pub async fn checkin(&self, key: String, conn: Connection<S>) {
        if conn.is_reusable() {
            self.idle.lock().await.insert(key, conn);
        }
    }
}

impl<S: AsyncStream> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}
