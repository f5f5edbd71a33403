//! Process-local store with optional per-entry TTL.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{value_as_count, StoreError, StoreProvider};

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// In-memory variant: a mutex-protected map of maps with lazy expiry.
/// `get` evicts expired entries on the way out; `scan` skips them.
#[derive(Debug, Default)]
pub struct InMemoryStoreProvider {
    data: Mutex<HashMap<String, HashMap<String, Entry>>>,
    ttl: Option<Duration>,
}

impl InMemoryStoreProvider {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            data: Mutex::default(),
            ttl,
        }
    }

    /// Per-entry TTL comes from `IMPOSTER_STORE_INMEMORY_TTL` (seconds).
    pub fn from_env() -> Self {
        let ttl = env::var("IMPOSTER_STORE_INMEMORY_TTL")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        Self::new(ttl)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<Instant> {
        ttl.or(self.ttl).map(|ttl| Instant::now() + ttl)
    }
}

impl StoreProvider for InMemoryStoreProvider {
    fn get(&self, store: &str, key: &str) -> Option<Value> {
        let mut data = self.data.lock().unwrap();
        let entries = data.get_mut(store)?;
        let now = Instant::now();
        if entries.get(key)?.expired(now) {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    fn put(&self, store: &str, key: &str, value: Value) {
        let expires_at = self.expiry(None);
        self.data
            .lock()
            .unwrap()
            .entry(store.to_owned())
            .or_default()
            .insert(key.to_owned(), Entry { value, expires_at });
    }

    fn scan(&self, store: &str, prefix: &str) -> BTreeMap<String, Value> {
        let data = self.data.lock().unwrap();
        let now = Instant::now();
        data.get(store)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(key, entry)| key.starts_with(prefix) && !entry.expired(now))
                    .map(|(key, entry)| (key.clone(), entry.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn delete(&self, store: &str, key: &str) {
        if let Some(entries) = self.data.lock().unwrap().get_mut(store) {
            entries.remove(key);
        }
    }

    fn delete_store(&self, store: &str) {
        self.data.lock().unwrap().remove(store);
    }

    fn atomic_inc(
        &self,
        store: &str,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let mut data = self.data.lock().unwrap();
        let entries = data.entry(store.to_owned()).or_default();
        let now = Instant::now();
        let current = entries
            .get(key)
            .filter(|entry| !entry.expired(now))
            .map(|entry| value_as_count(Some(&entry.value)))
            .unwrap_or(0);
        let count = current + delta;
        // expiry is only stamped when the counter is created
        let expires_at = match entries.get(key) {
            Some(existing) if !existing.expired(now) => existing.expires_at,
            _ => self.expiry(ttl),
        };
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::from(count),
                expires_at,
            },
        );
        Ok(count)
    }

    fn atomic_dec(&self, store: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.atomic_inc(store, key, -delta, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expired_entries_read_as_absent() {
        let provider = InMemoryStoreProvider::new(Some(Duration::from_millis(20)));
        provider.put("s", "k", json!("v"));
        assert_eq!(provider.get("s", "k"), Some(json!("v")));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(provider.get("s", "k"), None);
        // lazy eviction removed the entry outright
        assert!(provider.data.lock().unwrap()["s"].is_empty());
    }

    #[test]
    fn scan_skips_expired_entries() {
        let provider = InMemoryStoreProvider::new(None);
        provider.put("s", "fresh", json!(1));
        provider.data.lock().unwrap().get_mut("s").unwrap().insert(
            "stale".to_owned(),
            Entry {
                value: json!(2),
                expires_at: Some(Instant::now() - Duration::from_secs(1)),
            },
        );

        let result = provider.scan("s", "");
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("fresh"));
    }

    #[test]
    fn counter_ttl_is_not_refreshed_on_increment() {
        let provider = InMemoryStoreProvider::new(None);
        let ttl = Some(Duration::from_secs(300));
        provider.atomic_inc("s", "n", 1, ttl).unwrap();
        let first_deadline = provider.data.lock().unwrap()["s"]["n"].expires_at;
        assert!(first_deadline.is_some());

        provider.atomic_inc("s", "n", 1, ttl).unwrap();
        let second_deadline = provider.data.lock().unwrap()["s"]["n"].expires_at;
        assert_eq!(first_deadline, second_deadline);
    }

    #[test]
    fn concurrent_counters_are_consistent() {
        use std::sync::Arc;

        let provider = Arc::new(InMemoryStoreProvider::new(None));
        let mut handles = vec![];
        for _ in 0..8 {
            let provider = Arc::clone(&provider);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    provider.atomic_inc("s", "n", 1, None).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(provider.atomic_inc("s", "n", 0, None).unwrap(), 800);
    }
}
