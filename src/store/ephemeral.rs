//! Per-request ephemeral store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use super::{value_as_count, StoreError, StoreProvider};

/// A private map constructed per exchange. Never shared across requests,
/// so the counters run under a single-thread assumption; the `Mutex` only
/// satisfies the provider contract.
#[derive(Debug, Default)]
pub struct EphemeralStoreProvider {
    data: Mutex<HashMap<String, Value>>,
}

impl StoreProvider for EphemeralStoreProvider {
    fn get(&self, _store: &str, key: &str) -> Option<Value> {
        self.data.lock().unwrap().get(key).cloned()
    }

    fn put(&self, _store: &str, key: &str, value: Value) {
        self.data.lock().unwrap().insert(key.to_owned(), value);
    }

    fn scan(&self, _store: &str, prefix: &str) -> BTreeMap<String, Value> {
        self.data
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn delete(&self, _store: &str, key: &str) {
        self.data.lock().unwrap().remove(key);
    }

    fn delete_store(&self, _store: &str) {
        self.data.lock().unwrap().clear();
    }

    fn atomic_inc(
        &self,
        _store: &str,
        key: &str,
        delta: i64,
        _ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let mut data = self.data.lock().unwrap();
        let count = value_as_count(data.get(key)) + delta;
        data.insert(key.to_owned(), Value::from(count));
        Ok(count)
    }

    fn atomic_dec(&self, _store: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.atomic_inc(_store, key, -delta, None)
    }
}
