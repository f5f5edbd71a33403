//! Distributed wide-column store variant.
//!
//! Layout: one item per (store-name, key) with a JSON-encoded `Value`
//! attribute and an optional numeric TTL attribute that the backend's
//! expiry sweeper honours eventually. The wire protocol lives behind
//! `WideColumnClient`; the deployment adapter supplies the real client
//! and `MemoryWideColumnClient` stands in for tests.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use super::{StoreError, StoreErrorKind, StoreProvider};

/// Narrow client contract for the wide-column backend. Items live in a
/// partition per store name; `add` is the backend's native atomic
/// counter and returns the post-operation count.
pub trait WideColumnClient: Send + Sync {
    fn get_item(&self, store_name: &str, key: &str) -> Result<Option<String>, StoreError>;

    fn put_item(
        &self,
        store_name: &str,
        key: &str,
        value: &str,
        ttl: Option<(&str, i64)>,
    ) -> Result<(), StoreError>;

    fn query_prefix(
        &self,
        store_name: &str,
        key_prefix: &str,
    ) -> Result<Vec<(String, String)>, StoreError>;

    fn delete_item(&self, store_name: &str, key: &str) -> Result<(), StoreError>;

    fn delete_partition(&self, store_name: &str) -> Result<(), StoreError>;

    fn add(
        &self,
        store_name: &str,
        key: &str,
        delta: i64,
        ttl: Option<(&str, i64)>,
    ) -> Result<i64, StoreError>;
}

pub struct WideColumnStoreProvider {
    client: Box<dyn WideColumnClient>,
    ttl_seconds: Option<i64>,
    ttl_attribute: String,
}

impl WideColumnStoreProvider {
    pub fn new(client: Box<dyn WideColumnClient>) -> Self {
        Self {
            client,
            ttl_seconds: None,
            ttl_attribute: "ttl".to_owned(),
        }
    }

    pub fn with_ttl(mut self, seconds: Option<i64>, attribute: impl Into<String>) -> Self {
        self.ttl_seconds = seconds;
        self.ttl_attribute = attribute.into();
        self
    }

    /// Reads `IMPOSTER_STORE_DYNAMODB_TABLE`, `IMPOSTER_STORE_DYNAMODB_REGION`,
    /// `IMPOSTER_STORE_DYNAMODB_TTL` and `IMPOSTER_STORE_DYNAMODB_TTL_ATTRIBUTE`.
    /// The wire client itself is an external collaborator; this fails until
    /// the deployment adapter registers one against the configured table.
    pub fn from_env() -> Result<Self, StoreError> {
        let table = env::var("IMPOSTER_STORE_DYNAMODB_TABLE")
            .map_err(|_| StoreErrorKind::Config("IMPOSTER_STORE_DYNAMODB_TABLE is not set".to_owned()))?;
        let region = env::var("IMPOSTER_STORE_DYNAMODB_REGION").unwrap_or_default();
        Err(StoreErrorKind::Config(format!(
            "no wide-column client registered for table {} (region {:?})",
            table, region
        ))
        .into())
    }

    /// TTL settings from the environment, reusable by deployment adapters
    /// that construct the provider with a real client.
    pub fn ttl_from_env() -> (Option<i64>, String) {
        let seconds = env::var("IMPOSTER_STORE_DYNAMODB_TTL")
            .ok()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|secs| *secs > 0);
        let attribute =
            env::var("IMPOSTER_STORE_DYNAMODB_TTL_ATTRIBUTE").unwrap_or_else(|_| "ttl".to_owned());
        (seconds, attribute)
    }

    fn ttl_value(&self, override_ttl: Option<Duration>) -> Option<(String, i64)> {
        let seconds = override_ttl
            .map(|ttl| ttl.as_secs() as i64)
            .or(self.ttl_seconds)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Some((self.ttl_attribute.clone(), now + seconds))
    }

    fn decode(raw: String) -> Value {
        serde_json::from_str(&raw).unwrap_or(Value::String(raw))
    }
}

impl StoreProvider for WideColumnStoreProvider {
    fn get(&self, store: &str, key: &str) -> Option<Value> {
        match self.client.get_item(store, key) {
            Ok(item) => item.map(Self::decode),
            Err(e) => {
                warn!("wide-column get failed for {}/{}: {}", store, key, e);
                None
            }
        }
    }

    fn put(&self, store: &str, key: &str, value: Value) {
        let encoded = value.to_string();
        let ttl = self.ttl_value(None);
        let ttl_ref = ttl.as_ref().map(|(attr, epoch)| (attr.as_str(), *epoch));
        if let Err(e) = self.client.put_item(store, key, &encoded, ttl_ref) {
            warn!("wide-column put failed for {}/{}: {}", store, key, e);
        }
    }

    fn scan(&self, store: &str, prefix: &str) -> BTreeMap<String, Value> {
        match self.client.query_prefix(store, prefix) {
            Ok(items) => items
                .into_iter()
                .map(|(key, raw)| (key, Self::decode(raw)))
                .collect(),
            Err(e) => {
                warn!("wide-column scan failed for {}: {}", store, e);
                BTreeMap::new()
            }
        }
    }

    fn delete(&self, store: &str, key: &str) {
        if let Err(e) = self.client.delete_item(store, key) {
            warn!("wide-column delete failed for {}/{}: {}", store, key, e);
        }
    }

    fn delete_store(&self, store: &str) {
        if let Err(e) = self.client.delete_partition(store) {
            warn!("wide-column delete-store failed for {}: {}", store, e);
        }
    }

    fn atomic_inc(
        &self,
        store: &str,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let ttl = self.ttl_value(ttl);
        let ttl_ref = ttl.as_ref().map(|(attr, epoch)| (attr.as_str(), *epoch));
        self.client.add(store, key, delta, ttl_ref)
    }

    fn atomic_dec(&self, store: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.client.add(store, key, -delta, None)
    }
}

impl<T: WideColumnClient + ?Sized> WideColumnClient for std::sync::Arc<T> {
    fn get_item(&self, store_name: &str, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get_item(store_name, key)
    }

    fn put_item(
        &self,
        store_name: &str,
        key: &str,
        value: &str,
        ttl: Option<(&str, i64)>,
    ) -> Result<(), StoreError> {
        (**self).put_item(store_name, key, value, ttl)
    }

    fn query_prefix(
        &self,
        store_name: &str,
        key_prefix: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        (**self).query_prefix(store_name, key_prefix)
    }

    fn delete_item(&self, store_name: &str, key: &str) -> Result<(), StoreError> {
        (**self).delete_item(store_name, key)
    }

    fn delete_partition(&self, store_name: &str) -> Result<(), StoreError> {
        (**self).delete_partition(store_name)
    }

    fn add(
        &self,
        store_name: &str,
        key: &str,
        delta: i64,
        ttl: Option<(&str, i64)>,
    ) -> Result<i64, StoreError> {
        (**self).add(store_name, key, delta, ttl)
    }
}

/// Process-local stand-in for the wide-column backend, used in tests.
#[derive(Debug, Default)]
pub struct MemoryWideColumnClient {
    items: Mutex<HashMap<(String, String), (String, Option<i64>)>>,
    /// When set, every call fails; exercises the swallow/propagate split.
    pub fail: std::sync::atomic::AtomicBool,
}

impl MemoryWideColumnClient {
    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            Err(StoreError::backend("simulated backend outage"))
        } else {
            Ok(())
        }
    }
}

impl WideColumnClient for MemoryWideColumnClient {
    fn get_item(&self, store_name: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&(store_name.to_owned(), key.to_owned()))
            .map(|(value, _)| value.clone()))
    }

    fn put_item(
        &self,
        store_name: &str,
        key: &str,
        value: &str,
        ttl: Option<(&str, i64)>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.items.lock().unwrap().insert(
            (store_name.to_owned(), key.to_owned()),
            (value.to_owned(), ttl.map(|(_, epoch)| epoch)),
        );
        Ok(())
    }

    fn query_prefix(
        &self,
        store_name: &str,
        key_prefix: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        self.check()?;
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|((store, key), _)| store == store_name && key.starts_with(key_prefix))
            .map(|((_, key), (value, _))| (key.clone(), value.clone()))
            .collect())
    }

    fn delete_item(&self, store_name: &str, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.items
            .lock()
            .unwrap()
            .remove(&(store_name.to_owned(), key.to_owned()));
        Ok(())
    }

    fn delete_partition(&self, store_name: &str) -> Result<(), StoreError> {
        self.check()?;
        self.items
            .lock()
            .unwrap()
            .retain(|(store, _), _| store != store_name);
        Ok(())
    }

    fn add(
        &self,
        store_name: &str,
        key: &str,
        delta: i64,
        ttl: Option<(&str, i64)>,
    ) -> Result<i64, StoreError> {
        self.check()?;
        let mut items = self.items.lock().unwrap();
        let entry = items
            .entry((store_name.to_owned(), key.to_owned()))
            .or_insert_with(|| ("0".to_owned(), ttl.map(|(_, epoch)| epoch)));
        let count = entry.0.parse::<i64>().unwrap_or(0) + delta;
        entry.0 = count.to_string();
        Ok(count)
    }
}
