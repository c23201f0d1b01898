//! Durable key-value store seam.
//!
//! Client state slices, settings and the offline queue are persisted as JSON
//! strings under fixed keys. The SQLite implementation lives in `db`; the
//! in-memory one backs tests and throwaway clients.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};

pub const KEY_INVENTORY: &str = "slice:inventory";
pub const KEY_ACCOUNTING: &str = "slice:accounting";
pub const KEY_ROOMS: &str = "slice:rooms";
pub const KEY_OFFLINE_QUEUE: &str = "offline_queue";

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> LedgerResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> LedgerResult<()>;
    fn remove(&self, key: &str) -> LedgerResult<()>;

    /// Journal a flush attempt. Stores without a journal ignore it.
    fn record_flush(&self, _slices: &str, _error: Option<&str>) -> LedgerResult<()> {
        Ok(())
    }
}

pub fn read_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> LedgerResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| LedgerError::Codec(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

pub fn write_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> LedgerResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> LedgerResult<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|e| LedgerError::Persistence(e.to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> LedgerResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| LedgerError::Persistence(e.to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> LedgerResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| LedgerError::Persistence(e.to_string()))?;
        values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_get_set_remove() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
        store.remove("a").unwrap();
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryKvStore::new();
        write_json(&store, "nums", &vec![1, 2, 3]).unwrap();
        let back: Option<Vec<i32>> = read_json(&store, "nums").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        store.set("broken", "{").unwrap();
        let broken: LedgerResult<Option<Vec<i32>>> = read_json(&store, "broken");
        assert!(matches!(broken, Err(LedgerError::Codec(_))));
    }
}
