//! TLS session cache boundary: a process-wide `host:port -> bytes` store.

use std::collections::HashMap;
use std::sync::Mutex;

pub trait SecurityStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: String, value: Vec<u8>);
    fn remove(&self, key: &str);
}

/// Reference implementation used by tests and standalone callers that don't
/// need cross-process persistence.
#[derive(Default)]
pub struct MemorySecurityStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecurityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecurityStore for MemorySecurityStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: String, value: Vec<u8>) {
        self.inner.lock().unwrap().insert(key, value);
    }

    fn remove(&self, key: &str) {
        self.inner.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_session() {
        let store = MemorySecurityStore::new();
        store.put("example.com:443".to_string(), vec![1, 2, 3]);
        assert_eq!(store.get("example.com:443"), Some(vec![1, 2, 3]));
        store.remove("example.com:443");
        assert_eq!(store.get("example.com:443"), None);
    }
}
