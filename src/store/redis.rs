//! Distributed hash/string store variant backed by Redis.
//!
//! Layout: one Redis key per (store-name, key), joined with `:`, holding
//! the JSON-encoded value. Scans are `SCAN MATCH` prefix searches over
//! the keyspace; counters use Redis' native `INCRBY`/`DECRBY`. An
//! optional expiry (`IMPOSTER_STORE_REDIS_EXPIRY`, Go-duration form) is
//! set when a counter is created and not refreshed on later increments.

use std::collections::BTreeMap;
use std::env;
use std::sync::Mutex;
use std::time::Duration;

use redis::Commands;
use serde_json::Value;

use super::{parse_go_duration, StoreError, StoreErrorKind, StoreProvider};

pub struct RedisStoreProvider {
    connection: Mutex<redis::Connection>,
    expiry: Option<Duration>,
}

impl RedisStoreProvider {
    /// Connects using `REDIS_ADDR` (host:port or full URL) and
    /// `REDIS_PASSWORD`. Connection failures fail server startup; a mock
    /// server with a half-configured distributed store helps nobody.
    pub fn from_env() -> Result<Self, StoreError> {
        let addr = env::var("REDIS_ADDR").unwrap_or_else(|_| "127.0.0.1:6379".to_owned());
        let url = if addr.starts_with("redis://") || addr.starts_with("rediss://") {
            addr.clone()
        } else {
            match env::var("REDIS_PASSWORD") {
                Ok(password) if !password.is_empty() => {
                    format!("redis://:{}@{}", password, addr)
                }
                _ => format!("redis://{}", addr),
            }
        };
        let expiry = env::var("IMPOSTER_STORE_REDIS_EXPIRY")
            .ok()
            .and_then(|raw| parse_go_duration(&raw));

        let client = redis::Client::open(url.as_str())
            .map_err(|e| StoreErrorKind::Config(format!("invalid redis address: {}", e)))?;
        let connection = client
            .get_connection()
            .map_err(|e| StoreErrorKind::Backend(format!("redis connect: {}", e)))?;
        info!("using redis store at {}", addr);
        Ok(Self {
            connection: Mutex::new(connection),
            expiry,
        })
    }

    fn entry_key(store: &str, key: &str) -> String {
        format!("{}:{}", store, key)
    }

    fn decode(raw: String) -> Value {
        serde_json::from_str(&raw).unwrap_or(Value::String(raw))
    }
}

impl StoreProvider for RedisStoreProvider {
    fn get(&self, store: &str, key: &str) -> Option<Value> {
        let mut conn = self.connection.lock().unwrap();
        match conn.get::<_, Option<String>>(Self::entry_key(store, key)) {
            Ok(raw) => raw.map(Self::decode),
            Err(e) => {
                warn!("redis get failed for {}/{}: {}", store, key, e);
                None
            }
        }
    }

    fn put(&self, store: &str, key: &str, value: Value) {
        let mut conn = self.connection.lock().unwrap();
        let result: Result<(), _> = conn.set(Self::entry_key(store, key), value.to_string());
        if let Err(e) = result {
            warn!("redis set failed for {}/{}: {}", store, key, e);
        }
    }

    fn scan(&self, store: &str, prefix: &str) -> BTreeMap<String, Value> {
        let mut conn = self.connection.lock().unwrap();
        let pattern = format!("{}:{}*", store, glob_escape(prefix));
        let keys: Vec<String> = match conn.scan_match::<_, String>(&pattern) {
            Ok(iter) => iter.collect(),
            Err(e) => {
                warn!("redis scan failed for {}: {}", store, e);
                return BTreeMap::new();
            }
        };

        let strip = format!("{}:", store);
        let mut result = BTreeMap::new();
        for full_key in keys {
            let Some(key) = full_key.strip_prefix(&strip) else {
                continue;
            };
            match conn.get::<_, Option<String>>(&full_key) {
                Ok(Some(raw)) => {
                    result.insert(key.to_owned(), Self::decode(raw));
                }
                Ok(None) => {}
                Err(e) => warn!("redis get failed for {}: {}", full_key, e),
            }
        }
        result
    }

    fn delete(&self, store: &str, key: &str) {
        let mut conn = self.connection.lock().unwrap();
        let result: Result<(), _> = conn.del(Self::entry_key(store, key));
        if let Err(e) = result {
            warn!("redis del failed for {}/{}: {}", store, key, e);
        }
    }

    fn delete_store(&self, store: &str) {
        let mut conn = self.connection.lock().unwrap();
        let pattern = format!("{}:*", store);
        let keys: Vec<String> = match conn.scan_match::<_, String>(&pattern) {
            Ok(iter) => iter.collect(),
            Err(e) => {
                warn!("redis scan failed for {}: {}", store, e);
                return;
            }
        };
        if keys.is_empty() {
            return;
        }
        let result: Result<(), _> = conn.del(keys);
        if let Err(e) = result {
            warn!("redis delete-store failed for {}: {}", store, e);
        }
    }

    fn atomic_inc(
        &self,
        store: &str,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.connection.lock().unwrap();
        let entry_key = Self::entry_key(store, key);
        let count: i64 = conn
            .incr(&entry_key, delta)
            .map_err(|e| StoreError::counter(format!("redis incrby: {}", e)))?;

        // INCRBY returning the delta itself means the key was created by
        // this call; that is the only moment expiry gets stamped.
        if count == delta {
            if let Some(expiry) = ttl.or(self.expiry) {
                let result: Result<(), _> = conn.expire(&entry_key, expiry.as_secs() as i64);
                if let Err(e) = result {
                    warn!("redis expire failed for {}: {}", entry_key, e);
                }
            }
        }
        Ok(count)
    }

    fn atomic_dec(&self, store: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection.lock().unwrap();
        conn.decr(Self::entry_key(store, key), delta)
            .map_err(|e| StoreError::counter(format!("redis decrby: {}", e)))
    }
}

/// Escape characters that are special in Redis glob patterns so a scan
/// prefix is matched literally.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keys_join_store_and_key_with_colon() {
        assert_eq!(RedisStoreProvider::entry_key("pets", "rex"), "pets:rex");
    }

    #[test]
    fn glob_special_characters_are_escaped() {
        assert_eq!(glob_escape("a*b?c"), r"a\*b\?c");
        assert_eq!(glob_escape("plain"), "plain");
    }

    #[test]
    fn decode_falls_back_to_raw_string() {
        assert_eq!(
            RedisStoreProvider::decode(r#"{"a":1}"#.to_owned()),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            RedisStoreProvider::decode("not json".to_owned()),
            Value::String("not json".to_owned())
        );
    }
}
